//! Universal selector fallback generation.
//!
//! When a cached selector stops working, the wrapper walks an ordered list
//! of generated candidates built from the plain text of the description.
//! The list is framework-agnostic: it covers text engines, ARIA roles,
//! click-handler attributes, labelling attributes and common tags, in
//! decreasing order of precision.

use aho_corasick::AhoCorasick;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref HAS_TEXT: Regex =
        Regex::new(r#":has-text\(\s*"([^"]+)"\s*\)"#).expect("valid has-text pattern");
    static ref TEXT_EQ_QUOTED: Regex =
        Regex::new(r#"text\s*=\s*"([^"]+)""#).expect("valid text= pattern");
    static ref QUOTED: Regex = Regex::new(r#""([^"]+)"|'([^']+)'"#).expect("valid quote pattern");
    /// Characters that mark a string as selector syntax rather than prose.
    static ref SELECTOR_SYNTAX: Regex =
        Regex::new(r"[#.\[\]>:=()]").expect("valid syntax pattern");

    /// Legacy/loose syntax fixed up front. Leftmost-longest matching keeps
    /// already-correct forms intact.
    static ref SYNTAX_FIX: AhoCorasick = AhoCorasick::builder()
        .match_kind(aho_corasick::MatchKind::LeftmostLongest)
        .build([":has-text(", ":text(", ":first-of-type", ":first-child", ":first"])
        .expect("valid syntax replacer");
    static ref SYNTAX_FIX_REPLACE: [&'static str; 5] = [
        ":has-text(",
        ":has-text(",
        ":first-of-type",
        ":first-child",
        ":first-of-type",
    ];
}

/// Extract the human text a description is really about.
///
/// Tries, in order: a `:has-text("X")` argument, a `text="X"` argument, any
/// quoted substring, then the raw description when it carries no selector
/// syntax. Returns `None` for pure-syntax inputs with no text payload.
pub fn extract_pure_text(description: &str) -> Option<String> {
    if let Some(caps) = HAS_TEXT.captures(description) {
        return Some(caps[1].trim().to_string());
    }
    if let Some(caps) = TEXT_EQ_QUOTED.captures(description) {
        return Some(caps[1].trim().to_string());
    }
    if let Some(caps) = QUOTED.captures(description) {
        let text = caps.get(1).or_else(|| caps.get(2))?.as_str().trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    let cleaned = description.trim();
    if cleaned.is_empty() || SELECTOR_SYNTAX.is_match(cleaned) {
        return None;
    }
    Some(cleaned.to_string())
}

/// Repair common selector syntax mistakes (`:text(` for `:has-text(`,
/// `:first` for `:first-of-type`).
pub fn fix_selector_syntax(selector: &str) -> String {
    SYNTAX_FIX.replace_all(selector, &*SYNTAX_FIX_REPLACE)
}

/// Build the ordered universal fallback list for a description.
///
/// The original description always comes first, followed by its
/// syntax-fixed form and the caller-supplied fallback, then the generated
/// text/role/handler/attribute/tag candidates. Duplicates are removed
/// preserving first position. No framework assumptions are made.
pub fn universal_fallbacks(description: &str, fallback: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(24);

    let original = description.trim();
    if !original.is_empty() {
        out.push(original.to_string());
        let fixed = fix_selector_syntax(original);
        out.push(fixed);
    }
    if let Some(f) = fallback {
        let f = f.trim();
        if !f.is_empty() {
            out.push(f.to_string());
        }
    }

    if let Some(text) = extract_pure_text(description) {
        let quoted = text.replace('"', "\\\"");

        out.push(format!("text=\"{}\"", quoted));
        out.push(format!("text={}", text));
        out.push(format!("*:has-text(\"{}\")", quoted));

        for role in ["button", "link", "menuitem"] {
            out.push(format!("[role={}]:has-text(\"{}\")", role, quoted));
        }
        for handler in ["onclick", "ng-click", "v-on\\:click"] {
            out.push(format!("[{}]:has-text(\"{}\")", handler, quoted));
        }
        for attr in ["aria-label", "title", "alt", "data-testid"] {
            out.push(format!("[{}*=\"{}\"]", attr, quoted));
        }

        out.push(format!("button:has-text(\"{}\")", quoted));
        out.push(format!("a:has-text(\"{}\")", quoted));
        out.push(format!("input[value*=\"{}\"]", quoted));
        out.push(format!("span:has-text(\"{}\")", quoted));
        out.push(format!("div:has-text(\"{}\")", quoted));

        out.push(format!("* >> text={}", text));
        out.push(format!("text=\"{}\" >> visible=true", quoted));
    }

    dedupe_preserving_order(out)
}

fn dedupe_preserving_order(candidates: Vec<String>) -> Vec<String> {
    let mut seen = hashbrown::HashSet::with_capacity(candidates.len());
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.clone()))
        .collect()
}
