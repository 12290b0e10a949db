//! Environment-independent composite cache keys.
//!
//! An enhanced key identifies a logical test across environments: the same
//! flow recorded on `staging.example.com:8443/orders/42` and replayed on
//! `www.example.com/orders/99` must produce the same key identity. Hosts are
//! stripped of environment labels, numeric path segments become `{id}`, and
//! step lists are reduced to their structure before hashing.

use crate::normalize::normalize;
use crate::signature::DomSignature;
use crate::fnv1a64;
use hashbrown::HashSet;
use url::Url;

/// Current schema version of the enhanced key layout.
pub const KEY_SCHEMA_VERSION: u32 = 2;

/// Host labels that name an environment rather than an application:
/// `www`, anything containing `stg`/`staging`, anything containing `prod`.
fn is_env_label(label: &str) -> bool {
    label == "www" || label.contains("staging") || label.contains("stg") || label.contains("prod")
}

/// One recorded step of a test, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TestStep {
    /// Step action ("click", "fill", "goto", ...).
    pub action: String,
    /// Target selector, if the step has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Concrete value the step used, if any. Only its presence is hashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl TestStep {
    /// New step with an action only.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            selector: None,
            value: None,
        }
    }

    /// Set the selector.
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Set the value.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Broad shape of a selector string, with concrete values stripped.
pub fn selector_shape(selector: &str) -> &'static str {
    let s = selector.trim();
    if s.starts_with("//") || s.starts_with("xpath=") {
        "xpath"
    } else if s.starts_with("text=") || s.contains(":has-text(") {
        "text"
    } else if s.starts_with('#') {
        "id"
    } else if s.starts_with('.') {
        "class"
    } else if s.contains("[role=") {
        "role"
    } else if s.contains('[') {
        "attribute"
    } else {
        "tag"
    }
}

/// Hash of a step list projected to `(action, selector shape, has value)`.
///
/// Two recordings of the same flow with different concrete values and ids
/// hash identically.
pub fn steps_structure_hash(steps: &[TestStep]) -> u64 {
    let mut buf = String::with_capacity(steps.len() * 16);
    for step in steps {
        buf.push_str(&step.action.trim().to_lowercase());
        buf.push(':');
        buf.push_str(step.selector.as_deref().map(selector_shape).unwrap_or("-"));
        buf.push(':');
        buf.push(if step.value.is_some() { '1' } else { '0' });
        buf.push('\n');
    }
    fnv1a64(buf.as_bytes())
}

/// Normalize a URL into an environment-independent pattern.
///
/// Scheme stripped, host lowercased, default ports dropped, local hosts
/// collapsed to `LOCAL`, environment labels (staging/stg/prod/www) removed
/// from the host, numeric path segments replaced by `{id}`.
pub fn normalize_url_pattern(raw: &str) -> String {
    let trimmed = raw.trim();
    let parsed = Url::parse(trimmed)
        .or_else(|_| Url::parse(&format!("https://{}", trimmed)));

    let url = match parsed {
        Ok(u) => u,
        Err(_) => return trimmed.to_lowercase(),
    };

    let host = url.host_str().unwrap_or("").to_lowercase();
    let host_pattern = if host == "localhost" || host == "127.0.0.1" || host.ends_with(".local") {
        "LOCAL".to_string()
    } else {
        let kept: Vec<&str> = host
            .split('.')
            .filter(|label| !is_env_label(label))
            .collect();
        if kept.is_empty() {
            "ENV".to_string()
        } else {
            kept.join(".")
        }
    };

    let mut pattern = host_pattern;
    if let Some(port) = url.port() {
        // non-default ports stay on non-collapsed hosts
        if pattern != "LOCAL" {
            pattern.push(':');
            pattern.push_str(&port.to_string());
        }
    }

    let mut path = String::new();
    for segment in url.path().split('/').filter(|s| !s.is_empty()) {
        path.push('/');
        if segment.chars().all(|c| c.is_ascii_digit()) {
            path.push_str("{id}");
        } else {
            path.push_str(&segment.to_lowercase());
        }
    }
    pattern.push_str(&path);
    pattern
}

/// Composite, environment-independent cache key.
#[derive(Debug, Clone, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct EnhancedKey {
    /// Schema version of the key layout.
    pub version: u32,
    /// Normalized test name.
    pub test_name: String,
    /// Environment-independent URL pattern.
    pub url_pattern: String,
    /// DOM signature of the page, when one was captured. Contributes to
    /// key similarity, not to key identity.
    pub dom_signature: Option<String>,
    /// Structure hash of the recorded steps.
    pub steps_hash: u64,
    /// Browser profile the key belongs to.
    pub profile: String,
}

impl EnhancedKey {
    /// Build a key from raw components.
    pub fn new(
        test_name: &str,
        url: &str,
        steps: &[TestStep],
        dom_signature: Option<String>,
        profile: &str,
    ) -> Self {
        Self {
            version: KEY_SCHEMA_VERSION,
            test_name: normalize(test_name).normalized,
            url_pattern: normalize_url_pattern(url),
            dom_signature,
            steps_hash: steps_structure_hash(steps),
            profile: profile.to_string(),
        }
    }

    /// Deterministic delimited serialization. Identical components always
    /// produce byte-identical strings.
    pub fn serialize(&self) -> String {
        format!(
            "v{}|{}|{}|{}|{:016x}|{}",
            self.version,
            escape(&self.test_name),
            escape(&self.url_pattern),
            escape(self.dom_signature.as_deref().unwrap_or("")),
            self.steps_hash,
            escape(&self.profile),
        )
    }

    /// Parse a serialized key back into components.
    pub fn deserialize(s: &str) -> Option<Self> {
        let mut parts = s.split('|');
        let version = parts.next()?.strip_prefix('v')?.parse().ok()?;
        let test_name = unescape(parts.next()?);
        // the dom signature itself contains `|`, but escaped fields do not
        let url_pattern = unescape(parts.next()?);
        let dom_signature = match parts.next()? {
            "" => None,
            sig => Some(unescape(sig)),
        };
        let steps_hash = u64::from_str_radix(parts.next()?, 16).ok()?;
        let profile = unescape(parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            version,
            test_name,
            url_pattern,
            dom_signature,
            steps_hash,
            profile,
        })
    }

    /// Hash of the stable identity fields (version, name, URL pattern,
    /// steps structure, profile). The DOM signature is deliberately
    /// excluded: it varies between captures of the same logical page and
    /// participates in similarity scoring instead.
    pub fn base_key_hash(&self) -> String {
        let identity = format!(
            "v{}|{}|{}|{:016x}|{}",
            self.version,
            escape(&self.test_name),
            escape(&self.url_pattern),
            self.steps_hash,
            escape(&self.profile),
        );
        format!("{:016x}", fnv1a64(identity.as_bytes()))
    }

    /// Hash of the pre-migration key layout: raw test name, raw URL,
    /// profile. Kept for the compatibility read path.
    pub fn legacy_key_hash(test_name: &str, url: &str, profile: &str) -> String {
        let legacy = format!(
            "{}|{}|{}",
            test_name.trim().to_lowercase(),
            url.trim(),
            profile
        );
        format!("{:016x}", fnv1a64(legacy.as_bytes()))
    }

    /// Weighted similarity to another key in `[0, 1]`.
    ///
    /// Field weights: profile 0.1, URL pattern 0.25, DOM signature 0.35,
    /// steps structure 0.2, test-name token overlap 0.1. Fully identical
    /// serialized keys short-circuit to 1.0.
    pub fn similarity(&self, other: &EnhancedKey) -> f64 {
        if self.serialize() == other.serialize() {
            return 1.0;
        }

        let mut score = 0.0;
        if self.profile == other.profile {
            score += 0.1;
        }
        if self.url_pattern == other.url_pattern {
            score += 0.25;
        }
        if let (Some(a), Some(b)) = (&self.dom_signature, &other.dom_signature) {
            if let Some(sim) = DomSignature::similarity_str(a, b) {
                score += 0.35 * sim;
            }
        }
        if self.steps_hash == other.steps_hash {
            score += 0.2;
        }
        score += 0.1 * name_overlap(&self.test_name, &other.test_name);
        score
    }
}

/// Plain Jaccard overlap of whitespace-separated name tokens.
fn name_overlap(a: &str, b: &str) -> f64 {
    let sa: HashSet<&str> = a.split_whitespace().collect();
    let sb: HashSet<&str> = b.split_whitespace().collect();
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let intersection = sa.intersection(&sb).count();
    let union = sa.len() + sb.len() - intersection;
    intersection as f64 / union as f64
}

fn escape(s: &str) -> String {
    s.replace('%', "%25").replace('|', "%7C")
}

fn unescape(s: &str) -> String {
    s.replace("%7C", "|").replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<TestStep> {
        vec![
            TestStep::new("goto"),
            TestStep::new("fill")
                .with_selector("#username")
                .with_value("alice"),
            TestStep::new("click").with_selector("button#login"),
        ]
    }

    #[test]
    fn test_url_pattern_environment_collapse() {
        assert_eq!(
            normalize_url_pattern("https://staging.example.com/orders/42"),
            "example.com/orders/{id}"
        );
        assert_eq!(
            normalize_url_pattern("https://www.example.com/orders/99"),
            "example.com/orders/{id}"
        );
        assert_eq!(
            normalize_url_pattern("https://staging.x/path/42"),
            normalize_url_pattern("https://prod.x/path/99"),
        );
    }

    #[test]
    fn test_url_pattern_local_hosts() {
        assert_eq!(normalize_url_pattern("http://localhost:3000/login"), "LOCAL/login");
        assert_eq!(normalize_url_pattern("http://127.0.0.1/login"), "LOCAL/login");
        assert_eq!(normalize_url_pattern("http://myapp.local/login"), "LOCAL/login");
    }

    #[test]
    fn test_url_pattern_ports() {
        // default ports vanish, explicit ones stay on real hosts
        assert_eq!(normalize_url_pattern("https://example.com:443/a"), "example.com/a");
        assert_eq!(
            normalize_url_pattern("https://example.com:8443/a"),
            "example.com:8443/a"
        );
    }

    #[test]
    fn test_url_pattern_unparsable_input() {
        assert_eq!(normalize_url_pattern("  Not A Url  "), "not a url");
    }

    #[test]
    fn test_selector_shapes() {
        assert_eq!(selector_shape("#login"), "id");
        assert_eq!(selector_shape(".btn-primary"), "class");
        assert_eq!(selector_shape("//div[@id='x']"), "xpath");
        assert_eq!(selector_shape("text=Save"), "text");
        assert_eq!(selector_shape("button:has-text(\"Save\")"), "text");
        assert_eq!(selector_shape("[role=button]"), "role");
        assert_eq!(selector_shape("input[name='q']"), "attribute");
        assert_eq!(selector_shape("button"), "tag");
    }

    #[test]
    fn test_steps_hash_ignores_values() {
        let a = vec![TestStep::new("fill")
            .with_selector("#user")
            .with_value("alice")];
        let b = vec![TestStep::new("fill")
            .with_selector("#name")
            .with_value("bob")];
        // same action, same shape, value present on both
        assert_eq!(steps_structure_hash(&a), steps_structure_hash(&b));

        let c = vec![TestStep::new("fill").with_selector("#user")];
        assert_ne!(steps_structure_hash(&a), steps_structure_hash(&c));
    }

    #[test]
    fn test_serialization_deterministic() {
        let a = EnhancedKey::new("Login Flow", "https://staging.x/path/42", &steps(), None, "default");
        let b = EnhancedKey::new("Login Flow", "https://staging.x/path/42", &steps(), None, "default");
        assert_eq!(a.serialize(), b.serialize());
        assert_eq!(a.base_key_hash(), b.base_key_hash());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let key = EnhancedKey::new(
            "login | special",
            "https://staging.x/path/42",
            &steps(),
            Some("C:0000000000000001|I:0000000000000002|K:0000000000000003".into()),
            "default",
        );
        let parsed = EnhancedKey::deserialize(&key.serialize()).expect("roundtrip");
        assert_eq!(parsed.test_name, key.test_name);
        assert_eq!(parsed.url_pattern, key.url_pattern);
        assert_eq!(parsed.steps_hash, key.steps_hash);
        assert_eq!(parsed.profile, key.profile);
    }

    #[test]
    fn test_cross_environment_identity() {
        let staging = EnhancedKey::new(
            "login flow",
            "https://staging.x/path/42",
            &steps(),
            Some("C:1|I:2|K:3".into()),
            "default",
        );
        let prod = EnhancedKey::new(
            "login flow",
            "https://prod.x/path/99",
            &steps(),
            Some("C:1|I:2|K:9".into()),
            "default",
        );
        // same identity despite environment and signature drift
        assert_eq!(staging.base_key_hash(), prod.base_key_hash());
        // similarity reflects the signature drift: 0.1 + 0.25 + 0.35*0.8 + 0.2 + 0.1
        assert!((staging.similarity(&prod) - 0.93).abs() < 1e-9);
    }

    #[test]
    fn test_similarity_exact_short_circuit() {
        let key = EnhancedKey::new("login flow", "https://x/", &steps(), None, "default");
        assert_eq!(key.similarity(&key.clone()), 1.0);
    }

    #[test]
    fn test_similarity_disjoint_keys() {
        let a = EnhancedKey::new("login flow", "https://x/a", &steps(), None, "default");
        let b = EnhancedKey::new("checkout", "https://y/b", &[], None, "other");
        assert!(a.similarity(&b) < 0.2);
    }

    #[test]
    fn test_legacy_hash_stable() {
        let a = EnhancedKey::legacy_key_hash("Login Flow", "https://x/", "default");
        let b = EnhancedKey::legacy_key_hash("login flow", "https://x/", "default");
        assert_eq!(a, b);
    }
}
