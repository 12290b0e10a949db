//! Input normalization and edit distance.
//!
//! Free-text descriptions ("Click the Submit button!") are folded into a
//! canonical form before any lookup or storage: lowercased, NFKC-folded,
//! stripped of punctuation, stopword-free and trivially stemmed. The same
//! pipeline runs on both sides of every comparison, so it has to stay pure
//! and deterministic.

use hashbrown::HashSet;
use lazy_static::lazy_static;
use smallvec::SmallVec;
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    /// Articles, auxiliaries and filler words that carry no signal for
    /// element identification.
    static ref STOPWORDS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        for w in [
            "the", "a", "an", "is", "am", "are", "was", "were", "be", "been",
            "being", "do", "does", "did", "will", "would", "shall", "should",
            "can", "could", "may", "might", "must", "have", "has", "had",
            "to", "of", "on", "in", "at", "for", "with", "please",
        ] {
            s.insert(w);
        }
        s
    };
}

/// Result of the normalization pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct NormalizedInput {
    /// Canonical whitespace-joined form of the surviving tokens.
    pub normalized: String,
    /// Ordered token list.
    pub tokens: SmallVec<[String; 8]>,
}

impl NormalizedInput {
    /// Whether normalization left anything usable.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Normalize a free-text description.
///
/// Pipeline: lowercase → unicode NFKC → strip punctuation (keeping dashes
/// that sit between word characters) → collapse whitespace → drop stopwords
/// → trivial stemming (trailing `ing`, then trailing `s`).
pub fn normalize(text: &str) -> NormalizedInput {
    let folded: String = text.to_lowercase().nfkc().collect();

    let mut cleaned = String::with_capacity(folded.len());
    let chars: Vec<char> = folded.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            cleaned.push(c);
        } else if c == '-'
            && i > 0
            && i + 1 < chars.len()
            && chars[i - 1].is_alphanumeric()
            && chars[i + 1].is_alphanumeric()
        {
            // internal dash: "sign-in" stays one token
            cleaned.push(c);
        } else {
            cleaned.push(' ');
        }
    }

    let mut tokens: SmallVec<[String; 8]> = SmallVec::new();
    for word in cleaned.split_whitespace() {
        if STOPWORDS.contains(word) {
            continue;
        }
        let stemmed = stem(word);
        if !stemmed.is_empty() {
            tokens.push(stemmed.to_string());
        }
    }

    NormalizedInput {
        normalized: tokens.join(" "),
        tokens,
    }
}

/// Trivial suffix stemming: `clicking` → `click`, `buttons` → `button`,
/// `press` stays `press`.
fn stem(word: &str) -> &str {
    if word.len() > 5 {
        if let Some(base) = word.strip_suffix("ing") {
            return base;
        }
    }
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        return &word[..word.len() - 1];
    }
    word
}

/// Damerau–Levenshtein edit distance (optimal string alignment): insertions,
/// deletions, substitutions and adjacent transpositions each cost 1.
pub fn damerau_levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());

    if n == 0 {
        return m;
    }
    if m == 0 {
        return n;
    }

    let mut d = vec![vec![0usize; m + 1]; n + 1];
    for (i, row) in d.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=m {
        d[0][j] = j;
    }

    for i in 1..=n {
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            let mut best = (d[i - 1][j] + 1).min(d[i][j - 1] + 1).min(d[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(d[i - 2][j - 2] + 1);
            }
            d[i][j] = best;
        }
    }

    d[n][m]
}
