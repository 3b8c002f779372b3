//! Utility helpers shared by the pipeline stages.
//!
//! Keyword matchers are compiled once per distinct keyword list and reused
//! across requests.  The string helpers here are all char-boundary safe so
//! that budgets expressed in characters never split a UTF-8 sequence.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A memoising wrapper around `AhoCorasick::new` to avoid recompiling
/// automata for repeated lists.  The cache key is a hash of the pattern list.
static AC_CACHE: Lazy<DashMap<u64, Option<Arc<AhoCorasick>>>> = Lazy::new(DashMap::new);

/// Given a list of literal keywords, return a shared case-insensitive
/// matcher reporting leftmost matches.  Returns `None` for an empty list or
/// a list the automaton builder rejects.
pub fn ac_for(list: &[String]) -> Option<Arc<AhoCorasick>> {
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return existing.clone();
    }
    let lower: Vec<String> = list
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    let built = if lower.is_empty() {
        None
    } else {
        match AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(lower)
        {
            Ok(ac) => Some(Arc::new(ac)),
            Err(err) => {
                tracing::warn!(error = %err, "failed to build keyword matcher, ignoring list");
                None
            }
        }
    };
    AC_CACHE.insert(key, built.clone());
    built
}

/// Byte offset of the first occurrence of any keyword in `text`.
pub fn find_first_keyword(text: &str, keywords: &[String]) -> Option<usize> {
    ac_for(keywords)?.find(text).map(|m| m.start())
}

/// Take at most `max_chars` characters of `text` starting at byte `start`.
pub fn char_window(text: &str, start: usize, max_chars: usize) -> &str {
    let tail = match text.get(start..) {
        Some(t) => t,
        None => return "",
    };
    match tail.char_indices().nth(max_chars) {
        Some((end, _)) => &tail[..end],
        None => tail,
    }
}

/// Truncate to `max_chars` characters.  The boolean reports whether
/// anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    let head = char_window(text, 0, max_chars);
    (head, head.len() < text.len())
}

/// Collapse every run of whitespace into a single space and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}
