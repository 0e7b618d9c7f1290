use super::types::ReferenceArtifact;
use crate::types::BlockType;

/// Prefix `prompt` with a preamble that ties it to the reference artifact.
///
/// Pure string transform; the generator receives the reference itself
/// separately on the request.
pub fn apply_preamble(prompt: &str, reference: Option<&ReferenceArtifact>) -> String {
    let Some(reference) = reference else {
        return prompt.to_string();
    };

    let subject = match reference.artifact.kind {
        BlockType::Text => "reference text",
        BlockType::Image => "reference image",
        BlockType::Video => "reference video",
    };
    let subject = match &reference.label {
        Some(label) => format!("{} {}", subject, label),
        None => subject.to_string(),
    };

    format!(
        "Keep characters, style, lighting and color palette consistent with the {}. {}",
        subject, prompt
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Artifact;

    #[test]
    fn test_no_reference_is_identity() {
        assert_eq!(apply_preamble("a red fox", None), "a red fox");
    }

    #[test]
    fn test_preamble_names_reference() {
        let reference = ReferenceArtifact {
            artifact: Artifact::media(BlockType::Image, "https://cdn.test/anchor.png"),
            label: Some("A01".into()),
        };
        let out = apply_preamble("a red fox", Some(&reference));
        assert!(out.starts_with("Keep characters"));
        assert!(out.contains("reference image A01"));
        assert!(out.ends_with("a red fox"));
    }
}
