//! Core types for block graphs
//!
//! Blocks are the nodes the user wires together; connections carry a
//! block's last output to its downstream blocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a block
pub type BlockId = String;

/// Unique identifier for a connection
pub type EdgeId = String;

/// Kind of content a block produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Plain text
    #[default]
    Text,
    /// Image, stored as a URL or data URI
    Image,
    /// Video, stored as a URL or data URI
    Video,
}

impl BlockType {
    /// Relative generation cost used by the completion predictor
    pub fn media_factor(&self) -> f64 {
        match self {
            BlockType::Text => 1.0,
            BlockType::Image => 2.0,
            BlockType::Video => 4.0,
        }
    }
}

/// Processing state of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    #[default]
    Idle,
    Processing,
    Error,
}

/// A node in the user's graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Opaque identity
    pub id: BlockId,
    /// Content kind
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// Human-facing label, e.g. "A01"
    pub number: String,
    /// Last produced artifact: text, or a URL/data URI for media
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: BlockStatus,
}

impl Block {
    /// Create an idle block
    pub fn new(
        id: impl Into<String>,
        block_type: BlockType,
        number: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            block_type,
            number: number.into(),
            content: content.into(),
            status: BlockStatus::Idle,
        }
    }

    /// Create an idle text block
    pub fn text(id: impl Into<String>, number: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, BlockType::Text, number, content)
    }

    /// Whether the block has usable content after trimming
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// Data carried along an edge, refreshed when the source block's output changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFlow {
    pub enabled: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub data_type: Option<BlockType>,
    pub last_data: Option<String>,
}

impl Default for DataFlow {
    fn default() -> Self {
        Self {
            enabled: true,
            last_update: None,
            data_type: None,
            last_data: None,
        }
    }
}

/// Directed edge from one block's output to another block's input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: EdgeId,
    pub from_id: BlockId,
    pub to_id: BlockId,
    /// Optional per-edge instruction shown to the downstream block
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub data_flow: DataFlow,
}

impl Connection {
    /// Create an enabled connection with an empty envelope
    pub fn new(id: impl Into<String>, from_id: impl Into<String>, to_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from_id: from_id.into(),
            to_id: to_id.into(),
            instruction: None,
            data_flow: DataFlow::default(),
        }
    }

    /// Attach an instruction to this connection
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }
}

/// Output of one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Kind of content produced
    pub kind: BlockType,
    /// Text content, or a URL/data URI for media
    pub value: String,
}

impl Artifact {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: BlockType::Text,
            value: value.into(),
        }
    }

    pub fn media(kind: BlockType, url: impl Into<String>) -> Self {
        Self {
            kind,
            value: url.into(),
        }
    }

    /// The downloadable reference, if this artifact points at one
    pub fn url(&self) -> Option<&str> {
        let v = self.value.as_str();
        if v.starts_with("http://") || v.starts_with("https://") || v.starts_with("data:") {
            Some(v)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_content_check() {
        assert!(Block::text("b1", "A01", "hello").has_content());
        assert!(!Block::text("b2", "A02", "   \n").has_content());
    }

    #[test]
    fn test_artifact_url() {
        assert_eq!(
            Artifact::media(BlockType::Video, "https://cdn.test/v.mp4").url(),
            Some("https://cdn.test/v.mp4")
        );
        assert_eq!(
            Artifact::media(BlockType::Image, "data:image/png;base64,AAAA").url(),
            Some("data:image/png;base64,AAAA")
        );
        assert_eq!(Artifact::text("just words").url(), None);
    }

    #[test]
    fn test_block_serializes_type_field() {
        let block = Block::new("b1", BlockType::Image, "A01", "");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["number"], "A01");
    }
}
