//! Layered DOM fingerprints for cross-environment page identity.
//!
//! A page snapshot is reduced to three strata — structural landmarks,
//! identified interactive elements, and prominent text — hashed separately
//! so two renderings of the same logical page compare as similar even when
//! the host, port or dynamic ids differ. Positions and volatile ids never
//! enter a hash.

use crate::fnv1a64;
use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Upper bound on remembered signatures per manager.
const RECENT_CAP: usize = 64;

lazy_static! {
    /// Ids that look machine-generated: trailing digit runs and uuid-like
    /// strings change between renders and must not reach a hash.
    static ref VOLATILE_ID: Regex = Regex::new(
        r"(?i)(?:^|[-_:])\d{3,}$|^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$"
    )
    .expect("valid volatile-id pattern");
}

/// One element of a structured DOM snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct DomElement {
    /// Lowercase tag name.
    pub tag: String,
    /// ARIA role, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// `id` attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// `name` attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `aria-label` attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aria_label: Option<String>,
    /// `data-testid` attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_testid: Option<String>,
    /// Visible text content, if prominent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl DomElement {
    /// New element with only a tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Set the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the name attribute.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the aria-label.
    pub fn with_aria_label(mut self, label: impl Into<String>) -> Self {
        self.aria_label = Some(label.into());
        self
    }

    /// Set the data-testid.
    pub fn with_data_testid(mut self, testid: impl Into<String>) -> Self {
        self.data_testid = Some(testid.into());
        self
    }

    /// Set the text content.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    fn is_critical(&self) -> bool {
        matches!(
            self.tag.as_str(),
            "form" | "main" | "nav" | "header" | "footer"
        ) || matches!(self.role.as_deref(), Some("button") | Some("link"))
    }

    fn is_important(&self) -> bool {
        self.id.is_some()
            || self.name.is_some()
            || self.aria_label.is_some()
            || self.data_testid.is_some()
    }

    fn is_context(&self) -> bool {
        matches!(
            self.tag.as_str(),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
        ) || self.text.as_deref().map_or(false, |t| !t.trim().is_empty())
    }

    /// Stable feature line for hashing: tag, role and identifying
    /// attributes, with volatile values dropped.
    fn feature_line(&self) -> String {
        let mut line = String::with_capacity(48);
        line.push_str("tag=");
        line.push_str(&self.tag);
        if let Some(role) = &self.role {
            line.push_str(";role=");
            line.push_str(role);
        }
        for (attr, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("aria-label", &self.aria_label),
            ("data-testid", &self.data_testid),
        ] {
            if let Some(v) = value {
                line.push(';');
                line.push_str(attr);
                if VOLATILE_ID.is_match(v) {
                    // presence is stable, the generated value is not
                    line.push_str("=*");
                } else {
                    line.push('=');
                    line.push_str(v);
                }
            }
        }
        if let Some(text) = &self.text {
            let t = text.trim();
            if !t.is_empty() {
                line.push_str(";text=");
                line.push_str(&t.to_lowercase());
            }
        }
        line
    }
}

/// A structured page snapshot handed in by the caller's page accessor.
#[derive(Debug, Clone, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct DomSnapshot {
    /// URL the snapshot was taken on.
    pub url: String,
    /// Elements in document order.
    pub elements: Vec<DomElement>,
}

/// Accessor capable of producing a structured DOM snapshot.
///
/// Implemented by the browser-driving layer. Returning `None` (page gone,
/// frame detached) makes DOM-signature paths degrade silently.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Capture the current DOM as a structured snapshot.
    async fn dom_snapshot(&self) -> Option<DomSnapshot>;
}

/// Three-strata fingerprint of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomSignature {
    /// Hash of structural landmarks.
    pub critical: u64,
    /// Hash of identified interactive elements.
    pub important: u64,
    /// Hash of headings and prominent text.
    pub context: u64,
}

impl DomSignature {
    /// Compute the signature of a snapshot.
    pub fn compute(snapshot: &DomSnapshot) -> Self {
        let mut critical: Vec<String> = Vec::new();
        let mut important: Vec<String> = Vec::new();
        let mut context: Vec<String> = Vec::new();

        for el in &snapshot.elements {
            let line = el.feature_line();
            if el.is_critical() {
                critical.push(line.clone());
            }
            if el.is_important() {
                important.push(line.clone());
            }
            if el.is_context() {
                context.push(line);
            }
        }

        Self {
            critical: hash_stratum(critical),
            important: hash_stratum(important),
            context: hash_stratum(context),
        }
    }

    /// Weighted similarity of two signatures:
    /// 0.5 × critical + 0.3 × important + 0.2 × context equality.
    pub fn similarity(&self, other: &DomSignature) -> f64 {
        let mut score = 0.0;
        if self.critical == other.critical {
            score += 0.5;
        }
        if self.important == other.important {
            score += 0.3;
        }
        if self.context == other.context {
            score += 0.2;
        }
        score
    }

    /// Similarity of two rendered signatures; `None` when either fails to
    /// parse.
    pub fn similarity_str(a: &str, b: &str) -> Option<f64> {
        let a = a.parse::<DomSignature>().ok()?;
        let b = b.parse::<DomSignature>().ok()?;
        Some(a.similarity(&b))
    }

    /// Whether a string is a well-formed rendered signature.
    pub fn is_valid(s: &str) -> bool {
        s.parse::<DomSignature>().is_ok()
    }
}

/// Order-independent stratum hash: feature lines are sorted before hashing
/// so render order never changes the fingerprint.
fn hash_stratum(mut lines: Vec<String>) -> u64 {
    lines.sort_unstable();
    lines.dedup();
    let mut buf = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for l in &lines {
        buf.push_str(l);
        buf.push('\n');
    }
    fnv1a64(buf.as_bytes())
}

impl fmt::Display for DomSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "C:{:016x}|I:{:016x}|K:{:016x}",
            self.critical, self.important, self.context
        )
    }
}

impl FromStr for DomSignature {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        let critical = parse_part(parts.next(), "C:")?;
        let important = parse_part(parts.next(), "I:")?;
        let context = parse_part(parts.next(), "K:")?;
        if parts.next().is_some() {
            return Err(());
        }
        Ok(Self {
            critical,
            important,
            context,
        })
    }
}

fn parse_part(part: Option<&str>, prefix: &str) -> Result<u64, ()> {
    let part = part.ok_or(())?;
    let hex = part.strip_prefix(prefix).ok_or(())?;
    u64::from_str_radix(hex, 16).map_err(|_| ())
}

/// Bounded per-instance memory of recently computed signatures by URL.
#[derive(Debug, Default)]
pub struct SignatureManager {
    recent: DashMap<String, RecentSignature>,
}

#[derive(Debug, Clone)]
struct RecentSignature {
    signature: String,
    stored_at: i64,
}

impl SignatureManager {
    /// New empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current signature of a page.
    ///
    /// On snapshot failure falls back to the most recent signature seen for
    /// the URL, if any; signature generation never errors outward.
    pub async fn capture(&self, page: &dyn SnapshotProvider, url: &str) -> Option<String> {
        match page.dom_snapshot().await {
            Some(snapshot) => {
                let sig = DomSignature::compute(&snapshot).to_string();
                self.remember(url, &sig);
                Some(sig)
            }
            None => {
                log::debug!("dom snapshot unavailable for {}, using recent", url);
                self.recent_for(url)
            }
        }
    }

    /// Most recent signature remembered for a URL.
    pub fn recent_for(&self, url: &str) -> Option<String> {
        self.recent.get(url).map(|r| r.signature.clone())
    }

    fn remember(&self, url: &str, signature: &str) {
        self.recent.insert(
            url.to_string(),
            RecentSignature {
                signature: signature.to_string(),
                stored_at: crate::now_ms(),
            },
        );
        while self.recent.len() > RECENT_CAP {
            let oldest = self
                .recent
                .iter()
                .min_by_key(|r| r.value().stored_at)
                .map(|r| r.key().clone());
            match oldest {
                Some(key) => {
                    self.recent.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_page() -> DomSnapshot {
        DomSnapshot {
            url: "https://staging.example.com/login".into(),
            elements: vec![
                DomElement::new("form").with_id("login-form"),
                DomElement::new("nav"),
                DomElement::new("input").with_name("username"),
                DomElement::new("input").with_name("password"),
                DomElement::new("button")
                    .with_role("button")
                    .with_id("login")
                    .with_text("Log in"),
                DomElement::new("h1").with_text("Welcome back"),
            ],
        }
    }

    #[test]
    fn test_signature_roundtrip() {
        let sig = DomSignature::compute(&login_page());
        let rendered = sig.to_string();
        assert!(DomSignature::is_valid(&rendered));
        assert_eq!(rendered.parse::<DomSignature>().unwrap(), sig);
    }

    #[test]
    fn test_signature_format() {
        let rendered = DomSignature::compute(&login_page()).to_string();
        assert!(rendered.starts_with("C:"));
        assert_eq!(rendered.split('|').count(), 3);
    }

    #[test]
    fn test_signature_stable_across_environments() {
        let mut prod = login_page();
        prod.url = "https://www.example.com/login".into();
        let a = DomSignature::compute(&login_page());
        let b = DomSignature::compute(&prod);
        // URL is not part of the signature
        assert_eq!(a, b);
        assert_eq!(a.similarity(&b), 1.0);
    }

    #[test]
    fn test_signature_ignores_element_order() {
        let page = login_page();
        let mut shuffled = page.clone();
        shuffled.elements.reverse();
        assert_eq!(
            DomSignature::compute(&page),
            DomSignature::compute(&shuffled)
        );
    }

    #[test]
    fn test_volatile_ids_do_not_change_signature() {
        let mut a = login_page();
        a.elements
            .push(DomElement::new("div").with_id("react-select-12345"));
        let mut b = login_page();
        b.elements
            .push(DomElement::new("div").with_id("react-select-99921"));
        assert_eq!(DomSignature::compute(&a), DomSignature::compute(&b));
    }

    #[test]
    fn test_partial_similarity() {
        let a = DomSignature {
            critical: 1,
            important: 2,
            context: 3,
        };
        let b = DomSignature {
            critical: 1,
            important: 2,
            context: 9,
        };
        assert!((a.similarity(&b) - 0.8).abs() < 1e-9);

        let c = DomSignature {
            critical: 7,
            important: 2,
            context: 3,
        };
        assert!((a.similarity(&c) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_signatures_rejected() {
        assert!(!DomSignature::is_valid(""));
        assert!(!DomSignature::is_valid("C:zz|I:00|K:00"));
        assert!(!DomSignature::is_valid("C:0|I:0"));
        assert!(!DomSignature::is_valid("C:0|I:0|K:0|X:0"));
    }

    struct FixedPage(Option<DomSnapshot>);

    #[async_trait]
    impl SnapshotProvider for FixedPage {
        async fn dom_snapshot(&self) -> Option<DomSnapshot> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_manager_capture_and_fallback() {
        let manager = SignatureManager::new();
        let url = "https://a/";

        let page = FixedPage(Some(login_page()));
        let sig = manager.capture(&page, url).await.expect("signature");
        assert!(DomSignature::is_valid(&sig));

        // provider failure falls back to the remembered signature
        let broken = FixedPage(None);
        assert_eq!(manager.capture(&broken, url).await, Some(sig));

        // unknown url with a broken provider degrades to None
        assert!(manager.capture(&broken, "https://b/").await.is_none());
    }
}
