//! Context-aware similarity between element descriptions.
//!
//! Similarity is Jaccard over normalized token sets, enriched with a closed
//! synonym table, with an action-verb layer on top: descriptions whose verbs
//! belong to mutually exclusive groups (login/logout, create/delete,
//! open/close) must never match, whatever their token overlap, so the
//! calculator returns a sentinel instead of a score.

use crate::normalize::normalize;
use hashbrown::{HashMap, HashSet};
use lazy_static::lazy_static;
use smallvec::SmallVec;

/// Sentinel returned when the two inputs carry conflicting actions.
///
/// Callers must treat this as "never match", not as a low score.
pub const CONFLICT: f64 = -1.0;

/// Action verb groups. Verbs in one group are interchangeable.
const ACTION_GROUPS: &[(&str, &[&str])] = &[
    ("click", &["click", "press", "tap", "hit", "select"]),
    ("type", &["type", "enter", "input", "fill"]),
    ("open", &["open"]),
    ("close", &["close"]),
    ("create", &["create", "add", "new"]),
    ("delete", &["delete", "remove"]),
    ("login", &["login", "log-in", "sign-in", "signin"]),
    ("logout", &["logout", "log-out", "sign-out", "signout"]),
];

/// Groups that must never match each other.
const CONFLICTING_GROUPS: &[(&str, &str)] = &[
    ("login", "logout"),
    ("create", "delete"),
    ("open", "close"),
];

/// Non-action synonyms treated as equal tokens.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["button", "btn"],
    &["dialog", "modal", "popup"],
    &["field", "textbox"],
    &["link", "anchor"],
    &["search", "find"],
];

lazy_static! {
    static ref VERB_TO_GROUP: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        for (group, verbs) in ACTION_GROUPS {
            for v in *verbs {
                m.insert(*v, *group);
            }
        }
        m
    };
    static ref SYNONYM_SETS: Vec<HashSet<&'static str>> = SYNONYM_GROUPS
        .iter()
        .map(|g| g.iter().copied().collect())
        .collect();
}

/// The operation a similarity check runs under. Each carries its own
/// inclusive acceptance threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(strum::Display, strum::EnumString, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    /// Searching stored tests by name.
    TestSearch,
    /// The reverse step of the lookup ladder.
    CacheLookup,
    /// Background pattern learning.
    PatternMatch,
    /// Cross-environment key matching.
    CrossEnv,
    /// Anything else.
    #[default]
    Default,
}

impl Operation {
    /// Inclusive lower bound for accepting a similarity score.
    pub fn threshold(&self) -> f64 {
        match self {
            Operation::TestSearch => 0.35,
            Operation::CacheLookup => 0.15,
            Operation::PatternMatch => 0.25,
            Operation::CrossEnv => 0.40,
            Operation::Default => 0.20,
        }
    }
}

/// Context a similarity computation runs in.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityContext<'a> {
    /// Current page URL, if known.
    pub url: Option<&'a str>,
    /// Browser profile, if known.
    pub profile: Option<&'a str>,
    /// Whether both sides were observed on the same domain.
    pub domain_match: bool,
    /// Operation kind, selecting threshold and penalties.
    pub operation: Operation,
}

impl<'a> Default for SimilarityContext<'a> {
    fn default() -> Self {
        Self {
            url: None,
            profile: None,
            domain_match: true,
            operation: Operation::Default,
        }
    }
}

impl<'a> SimilarityContext<'a> {
    /// Context for an operation with everything else defaulted.
    pub fn for_operation(operation: Operation) -> Self {
        Self {
            operation,
            ..Default::default()
        }
    }
}

/// Interchangeable verbs for a word, when it belongs to an action group.
pub fn action_synonyms(word: &str) -> Option<&'static [&'static str]> {
    let group = VERB_TO_GROUP.get(word)?;
    ACTION_GROUPS
        .iter()
        .find(|(name, _)| name == group)
        .map(|(_, verbs)| *verbs)
}

/// Action groups present in a token list, in token order, deduplicated.
pub fn extract_actions(tokens: &[String]) -> SmallVec<[&'static str; 2]> {
    let mut out: SmallVec<[&'static str; 2]> = SmallVec::new();
    for t in tokens {
        if let Some(&group) = VERB_TO_GROUP.get(t.as_str()) {
            if !out.contains(&group) {
                out.push(group);
            }
        }
    }
    out
}

/// Whether two action-group sets contain a mutually exclusive pair.
fn conflicting(a: &[&'static str], b: &[&'static str]) -> bool {
    for (x, y) in CONFLICTING_GROUPS {
        let hit = (a.contains(x) && b.contains(y)) || (a.contains(y) && b.contains(x));
        if hit {
            return true;
        }
    }
    false
}

/// Two normalized tokens are equal when identical, in the same action
/// group, or in the same synonym group.
fn tokens_equal(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    if let (Some(ga), Some(gb)) = (VERB_TO_GROUP.get(a), VERB_TO_GROUP.get(b)) {
        if ga == gb {
            return true;
        }
    }
    SYNONYM_SETS
        .iter()
        .any(|set| set.contains(a) && set.contains(b))
}

/// Similarity of two raw descriptions under a context.
///
/// Returns a score in `[0, 1]`, or [`CONFLICT`] when the descriptions carry
/// mutually exclusive actions. Empty inputs score 0.
pub fn similarity(a: &str, b: &str, ctx: &SimilarityContext) -> f64 {
    let na = normalize(a);
    let nb = normalize(b);
    token_similarity(&na.tokens, &nb.tokens, ctx)
}

/// Similarity of two already-normalized token lists. See [`similarity`].
pub fn token_similarity(a: &[String], b: &[String], ctx: &SimilarityContext) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let actions_a = extract_actions(a);
    let actions_b = extract_actions(b);
    if conflicting(&actions_a, &actions_b) {
        return CONFLICT;
    }

    // Jaccard over unique tokens with synonym-aware equality.
    let unique_a = dedupe(a);
    let unique_b = dedupe(b);
    let mut used = vec![false; unique_b.len()];
    let mut intersection = 0usize;
    for x in &unique_a {
        for (i, y) in unique_b.iter().enumerate() {
            if !used[i] && tokens_equal(x, y) {
                used[i] = true;
                intersection += 1;
                break;
            }
        }
    }
    let union = unique_a.len() + unique_b.len() - intersection;
    let mut score = intersection as f64 / union as f64;

    // Same action group on both sides strengthens the match.
    if !actions_a.is_empty() && actions_a.iter().any(|g| actions_b.contains(g)) {
        score = (score + 0.10).min(1.0);
    }

    if !ctx.domain_match && ctx.operation == Operation::CrossEnv {
        score *= 0.85;
    }

    score
}

fn dedupe(tokens: &[String]) -> Vec<&str> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(tokens.len());
    for t in tokens {
        if seen.insert(t.as_str()) {
            out.push(t.as_str());
        }
    }
    out
}
