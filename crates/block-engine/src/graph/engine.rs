//! Dependency tracking and content propagation between blocks
//!
//! The [`DependencyGraph`] owns the edge table and a cache of each block's
//! last output. Recording an output refreshes the data-flow envelope of every
//! outgoing edge under the same write lock, so readers never observe one
//! without the other.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::references;
use super::validation::{validate_graph, ValidationReport};
use crate::constants;
use crate::types::{Block, BlockId, BlockType, Connection, DataFlow};

/// Cached output of one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockOutput {
    pub block_id: BlockId,
    pub number: String,
    pub block_type: BlockType,
    pub content: String,
    pub produced_at: DateTime<Utc>,
    /// Monotonic per-engine counter; breaks timestamp ties
    pub sequence: u64,
}

/// Content of one upstream block, as seen by a downstream block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamData {
    pub block_id: BlockId,
    pub number: String,
    pub block_type: BlockType,
    pub content: String,
    pub produced_at: DateTime<Utc>,
    /// Instruction attached to the connecting edge, if any
    pub instruction: Option<String>,
}

#[derive(Debug, Default)]
struct GraphState {
    edges: Vec<Connection>,
    outputs: HashMap<BlockId, BlockOutput>,
    sequence: u64,
}

impl GraphState {
    fn envelope_for(output: &BlockOutput, enabled: bool) -> DataFlow {
        DataFlow {
            enabled,
            last_update: Some(output.produced_at),
            data_type: Some(output.block_type),
            last_data: Some(output.content.clone()),
        }
    }
}

/// Engine-owned edge table and content cache
///
/// Callers never touch the maps directly; all access goes through the
/// query/command methods below.
#[derive(Debug)]
pub struct DependencyGraph {
    state: RwLock<GraphState>,
    edge_warning_threshold: usize,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    /// Create an empty graph with the default complexity threshold
    pub fn new() -> Self {
        Self::with_edge_warning_threshold(constants::graph::EDGE_WARNING_THRESHOLD)
    }

    pub fn with_edge_warning_threshold(threshold: usize) -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            edge_warning_threshold: threshold,
        }
    }

    /// Replace the tracked edge set.
    ///
    /// Envelopes of edges that survive (same id) are kept, new edges are
    /// seeded from their source's cached output, and envelopes of edges no
    /// longer present are dropped with them.
    pub fn upsert_edges(&self, edges: Vec<Connection>) {
        let mut state = self.state.write();

        let previous: HashMap<String, DataFlow> = state
            .edges
            .drain(..)
            .map(|e| (e.id, e.data_flow))
            .collect();

        let mut next = Vec::with_capacity(edges.len());
        for mut edge in edges {
            if let Some(flow) = previous.get(&edge.id) {
                let enabled = edge.data_flow.enabled;
                edge.data_flow = flow.clone();
                edge.data_flow.enabled = enabled;
            } else if let Some(output) = state.outputs.get(&edge.from_id) {
                edge.data_flow = GraphState::envelope_for(output, edge.data_flow.enabled);
            }
            next.push(edge);
        }

        log::debug!(
            "Tracking {} connections ({} previously)",
            next.len(),
            previous.len()
        );
        state.edges = next;
    }

    /// Record a block's newly produced content.
    ///
    /// Updates the content cache and refreshes the envelope on every
    /// outgoing edge of `block_id` atomically.
    pub fn record_output(
        &self,
        block_id: &str,
        content: impl Into<String>,
        block_type: BlockType,
        number: impl Into<String>,
    ) -> BlockOutput {
        self.record_output_at(block_id, content, block_type, number, Utc::now())
    }

    /// Same as [`record_output`](Self::record_output) with an explicit
    /// production time, for hosts restoring previously generated content.
    pub fn record_output_at(
        &self,
        block_id: &str,
        content: impl Into<String>,
        block_type: BlockType,
        number: impl Into<String>,
        produced_at: DateTime<Utc>,
    ) -> BlockOutput {
        let mut state = self.state.write();
        state.sequence += 1;

        let output = BlockOutput {
            block_id: block_id.to_string(),
            number: number.into(),
            block_type,
            content: content.into(),
            produced_at,
            sequence: state.sequence,
        };

        let mut refreshed = 0usize;
        for edge in state.edges.iter_mut().filter(|e| e.from_id == block_id) {
            edge.data_flow = GraphState::envelope_for(&output, edge.data_flow.enabled);
            refreshed += 1;
        }
        state.outputs.insert(block_id.to_string(), output.clone());

        log::debug!(
            "Recorded output for block '{}' ({}), refreshed {} edges",
            block_id,
            output.number,
            refreshed
        );
        output
    }

    /// Content of every block with an enabled edge into `block_id`, oldest first
    ///
    /// Several edges from the same source collapse into one entry carrying
    /// the first edge's instruction. Sources without cached output are skipped.
    pub fn upstream_of(&self, block_id: &str) -> Vec<UpstreamData> {
        let state = self.state.read();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut upstream: Vec<(u64, UpstreamData)> = Vec::new();

        for edge in state
            .edges
            .iter()
            .filter(|e| e.to_id == block_id && e.data_flow.enabled)
        {
            if !seen.insert(edge.from_id.as_str()) {
                continue;
            }
            if let Some(output) = state.outputs.get(&edge.from_id) {
                upstream.push((
                    output.sequence,
                    UpstreamData {
                        block_id: output.block_id.clone(),
                        number: output.number.clone(),
                        block_type: output.block_type,
                        content: output.content.clone(),
                        produced_at: output.produced_at,
                        instruction: edge.instruction.clone(),
                    },
                ));
            }
        }

        upstream.sort_by(|(seq_a, a), (seq_b, b)| {
            a.produced_at.cmp(&b.produced_at).then(seq_a.cmp(seq_b))
        });
        upstream.into_iter().map(|(_, data)| data).collect()
    }

    /// Validate `blocks` against the tracked edge set
    pub fn validate(&self, blocks: &[Block]) -> ValidationReport {
        let state = self.state.read();
        validate_graph(&state.edges, blocks, self.edge_warning_threshold)
    }

    /// Validate an arbitrary edge set without touching tracked state
    pub fn validate_edges(&self, edges: &[Connection], blocks: &[Block]) -> ValidationReport {
        validate_graph(edges, blocks, self.edge_warning_threshold)
    }

    /// Enable or disable data flow on one edge. Returns false if unknown.
    pub fn set_edge_enabled(&self, edge_id: &str, enabled: bool) -> bool {
        let mut state = self.state.write();
        match state.edges.iter_mut().find(|e| e.id == edge_id) {
            Some(edge) => {
                edge.data_flow.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Forget a block's cached output and clear the envelopes it fed
    pub fn remove_block(&self, block_id: &str) {
        let mut state = self.state.write();
        state.outputs.remove(block_id);
        for edge in state.edges.iter_mut().filter(|e| e.from_id == block_id) {
            edge.data_flow = DataFlow {
                enabled: edge.data_flow.enabled,
                ..DataFlow::default()
            };
        }
    }

    /// Drop all edges and cached outputs
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.edges.clear();
        state.outputs.clear();
    }

    pub fn cached_output(&self, block_id: &str) -> Option<BlockOutput> {
        self.state.read().outputs.get(block_id).cloned()
    }

    /// Look up cached output by the block's human-facing number (e.g. "A01")
    pub fn output_by_number(&self, number: &str) -> Option<BlockOutput> {
        self.state
            .read()
            .outputs
            .values()
            .find(|o| o.number.eq_ignore_ascii_case(number))
            .cloned()
    }

    /// Snapshot of the tracked edges with their envelopes
    pub fn edges(&self) -> Vec<Connection> {
        self.state.read().edges.clone()
    }

    /// Ids of blocks with an edge into `block_id`
    pub fn dependencies_of(&self, block_id: &str) -> Vec<BlockId> {
        let state = self.state.read();
        let mut ids: Vec<BlockId> = Vec::new();
        for edge in state.edges.iter().filter(|e| e.to_id == block_id) {
            if !ids.contains(&edge.from_id) {
                ids.push(edge.from_id.clone());
            }
        }
        ids
    }

    /// Ids of blocks fed by `block_id`
    pub fn dependents_of(&self, block_id: &str) -> Vec<BlockId> {
        let state = self.state.read();
        let mut ids: Vec<BlockId> = Vec::new();
        for edge in state.edges.iter().filter(|e| e.from_id == block_id) {
            if !ids.contains(&edge.to_id) {
                ids.push(edge.to_id.clone());
            }
        }
        ids
    }

    /// Replace `[A01]`-style tokens in `text` with cached block content
    ///
    /// Tokens that match no cached output are left as written.
    pub fn resolve_references(&self, text: &str) -> String {
        references::resolve_references(text, |number| {
            self.output_by_number(number).map(|o| o.content)
        })
    }
}
