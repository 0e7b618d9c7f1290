//! Prompt file parsing for file-driven batches.
//!
//! Prompts are separated by runs of six or more `*`. Files without such a
//! separator are read one prompt per line.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::PromptFileOptions;
use crate::error::{EngineError, Result};

static SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*{6,}").expect("separator pattern is valid"));

static NO_WORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\s\p{P}\p{S}]*$").expect("punctuation pattern is valid"));

/// Result of parsing a prompt file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPrompts {
    pub prompts: Vec<String>,
    /// Non-fatal notes, e.g. prompts dropped by the cap
    pub warnings: Vec<String>,
    /// Candidates rejected as too short or without words
    pub rejected: usize,
}

/// Split `text` into prompts.
///
/// Fails only when no valid prompt remains.
pub fn parse_prompts(text: &str, options: &PromptFileOptions) -> Result<ParsedPrompts> {
    if SEPARATOR.is_match(text) {
        select_prompts(SEPARATOR.split(text), options)
    } else {
        select_prompts(text.lines(), options)
    }
}

/// Trim, filter and cap prompt candidates.
pub fn select_prompts<'a, I>(candidates: I, options: &PromptFileOptions) -> Result<ParsedPrompts>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut prompts = Vec::new();
    let mut rejected = 0;
    for candidate in candidates {
        let prompt = candidate.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt.chars().count() < options.min_length || NO_WORDS.is_match(prompt) {
            rejected += 1;
            continue;
        }
        prompts.push(prompt.to_string());
    }

    if prompts.is_empty() {
        return Err(EngineError::invalid_batch(format!(
            "no valid prompts found (minimum length {})",
            options.min_length
        )));
    }

    let mut warnings = Vec::new();
    if rejected > 0 {
        log::debug!("Rejected {} prompt candidates", rejected);
        warnings.push(format!(
            "Skipped {} prompts shorter than {} characters or without words",
            rejected, options.min_length
        ));
    }
    if prompts.len() > options.max_prompts {
        let found = prompts.len();
        prompts.truncate(options.max_prompts);
        log::warn!("Prompt list capped at {} of {} prompts", options.max_prompts, found);
        warnings.push(format!(
            "Found {} prompts, only the first {} will be processed",
            found, options.max_prompts
        ));
    }

    Ok(ParsedPrompts {
        prompts,
        warnings,
        rejected,
    })
}

/// Read and parse a prompt file
pub async fn load_prompt_file(
    path: impl AsRef<Path>,
    options: &PromptFileOptions,
) -> Result<ParsedPrompts> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await?;
    let parsed = parse_prompts(&text, options)?;
    log::info!("Loaded {} prompts from {:?}", parsed.prompts.len(), path);
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> PromptFileOptions {
        PromptFileOptions {
            min_length: 5,
            max_prompts: 50,
        }
    }

    #[test]
    fn test_star_separator() {
        let text = "A castle on a hill\n******\nA ship at sea\n**********\n  A forest path  ";
        let parsed = parse_prompts(text, &options()).unwrap();
        assert_eq!(
            parsed.prompts,
            vec!["A castle on a hill", "A ship at sea", "A forest path"]
        );
    }

    #[test]
    fn test_line_fallback() {
        let text = "A castle on a hill\nA ship at sea\n\n";
        let parsed = parse_prompts(text, &options()).unwrap();
        assert_eq!(parsed.prompts.len(), 2);
    }

    #[test]
    fn test_short_star_runs_are_not_separators() {
        let text = "A castle ***** on a hill";
        let parsed = parse_prompts(text, &options()).unwrap();
        assert_eq!(parsed.prompts, vec!["A castle ***** on a hill"]);
    }

    #[test]
    fn test_rejects_short_and_punctuation_only() {
        let text = "ok\n.....!!!\nA valid prompt here\n--- ---";
        let parsed = parse_prompts(text, &options()).unwrap();
        assert_eq!(parsed.prompts, vec!["A valid prompt here"]);
        assert_eq!(parsed.rejected, 3);
    }

    #[test]
    fn test_cap_warns_with_original_count() {
        let text: String = (0..60).map(|i| format!("Prompt number {}\n", i)).collect();
        let parsed = parse_prompts(&text, &options()).unwrap();
        assert_eq!(parsed.prompts.len(), 50);
        let cap_warnings: Vec<_> = parsed
            .warnings
            .iter()
            .filter(|w| w.contains("only the first"))
            .collect();
        assert_eq!(cap_warnings.len(), 1);
        assert!(cap_warnings[0].contains("60"));
        assert_eq!(parsed.prompts[49], "Prompt number 49");
    }

    #[test]
    fn test_nothing_valid_is_an_error() {
        let err = parse_prompts("a\nb\n???", &options()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBatch(_)));
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("prompts.txt");
        tokio::fs::write(&path, "First prompt text\n******\nSecond prompt text")
            .await
            .unwrap();

        let parsed = load_prompt_file(&path, &options()).await.unwrap();
        assert_eq!(parsed.prompts.len(), 2);

        let missing = load_prompt_file(temp_dir.path().join("nope.txt"), &options()).await;
        assert!(matches!(missing, Err(EngineError::Io(_))));
    }
}
