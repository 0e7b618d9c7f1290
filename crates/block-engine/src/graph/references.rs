//! `[ID]` reference tokens in prompts
//!
//! Prompts may embed the human-facing number of another block, e.g.
//! `"Animate [A01] in the style of [B02]"`. Resolving those tokens is the
//! host's job before a prompt reaches the batch queue; these helpers do it.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([A-Za-z]+[0-9]+)\]").expect("reference pattern is valid"));

/// Block numbers referenced by `text`, in first-seen order without repeats
pub fn extract_references(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in REFERENCE.captures_iter(text) {
        let number = caps[1].to_string();
        if !found.iter().any(|f| f.eq_ignore_ascii_case(&number)) {
            found.push(number);
        }
    }
    found
}

/// Replace each token for which `lookup` returns content
pub fn resolve_references<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    REFERENCE
        .replace_all(text, |caps: &Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
