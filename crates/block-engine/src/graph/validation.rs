//! Graph validation for block graphs
//!
//! Validates edge endpoints, detects cycles, and raises advisory warnings.
//! Problems are returned as values; validation never fails.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{Block, BlockId, Connection, EdgeId};

/// Which end of an edge is dangling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Source,
    Target,
}

/// Validation error with location context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    /// An edge references a block that does not exist
    MissingEndpoint {
        edge_id: EdgeId,
        block_id: BlockId,
        endpoint: Endpoint,
    },
    /// A cycle closes at `closing_edge_id`, which points back to `closing_block_id`
    CycleDetected {
        /// Every block on the cycle, in traversal order
        block_ids: Vec<BlockId>,
        closing_edge_id: EdgeId,
        closing_block_id: BlockId,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEndpoint {
                edge_id,
                block_id,
                endpoint,
            } => {
                let end = match endpoint {
                    Endpoint::Source => "source",
                    Endpoint::Target => "target",
                };
                write!(f, "Edge '{}' references unknown {} block '{}'", edge_id, end, block_id)
            }
            Self::CycleDetected {
                block_ids,
                closing_edge_id,
                ..
            } => {
                write!(
                    f,
                    "Cycle detected through {} (closed by edge '{}')",
                    block_ids.join(" -> "),
                    closing_edge_id
                )
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Non-fatal findings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationWarning {
    /// The graph has more edges than the advisory threshold
    TooManyEdges { edge_count: usize, threshold: usize },
    /// More than one edge joins the same pair of blocks
    DuplicateEdge {
        from_id: BlockId,
        to_id: BlockId,
        edge_ids: Vec<EdgeId>,
    },
    /// A block has no edges while others do
    IsolatedBlock { block_id: BlockId },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooManyEdges {
                edge_count,
                threshold,
            } => write!(
                f,
                "Graph has {} connections (more than {}); execution may be slow",
                edge_count, threshold
            ),
            Self::DuplicateEdge {
                from_id,
                to_id,
                edge_ids,
            } => write!(
                f,
                "{} connections join '{}' to '{}'",
                edge_ids.len(),
                from_id,
                to_id
            ),
            Self::IsolatedBlock { block_id } => {
                write!(f, "Block '{}' has no connections", block_id)
            }
        }
    }
}

/// Outcome of validating a graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    /// Every block id that participates in a reported cycle
    pub fn cycle_blocks(&self) -> HashSet<&str> {
        self.errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::CycleDetected { block_ids, .. } => Some(block_ids),
                _ => None,
            })
            .flatten()
            .map(|s| s.as_str())
            .collect()
    }

    pub fn has_cycle(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, ValidationError::CycleDetected { .. }))
    }
}

/// Validate a block graph
///
/// Returns all errors found (not just the first). The result depends only on
/// the inputs and their order, so validating an unchanged graph twice yields
/// identical reports.
pub fn validate_graph(
    edges: &[Connection],
    blocks: &[Block],
    edge_warning_threshold: usize,
) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    validate_edge_endpoints(edges, blocks, &mut errors);
    detect_cycles(edges, blocks, &mut errors);

    if edges.len() > edge_warning_threshold {
        warnings.push(ValidationWarning::TooManyEdges {
            edge_count: edges.len(),
            threshold: edge_warning_threshold,
        });
    }
    find_duplicate_edges(edges, &mut warnings);
    find_isolated_blocks(edges, blocks, &mut warnings);

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Order blocks so every block comes after all of its upstream blocks
///
/// Uses Kahn's algorithm; ties keep the order of `blocks`. Returns the
/// validation report instead when the graph is not a valid DAG.
pub fn topological_order(
    edges: &[Connection],
    blocks: &[Block],
) -> std::result::Result<Vec<BlockId>, ValidationReport> {
    let report = validate_graph(edges, blocks, usize::MAX);
    if !report.is_valid {
        return Err(report);
    }

    let mut in_degree: HashMap<&str, usize> = blocks.iter().map(|b| (b.id.as_str(), 0)).collect();
    for edge in edges {
        if let Some(deg) = in_degree.get_mut(edge.to_id.as_str()) {
            *deg += 1;
        }
    }

    let mut queue: VecDeque<&str> = blocks
        .iter()
        .map(|b| b.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut order = Vec::with_capacity(blocks.len());
    while let Some(block_id) = queue.pop_front() {
        order.push(block_id.to_string());
        for edge in edges.iter().filter(|e| e.from_id == block_id) {
            if let Some(deg) = in_degree.get_mut(edge.to_id.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(&edge.to_id);
                }
            }
        }
    }

    Ok(order)
}

/// Check that all edge endpoints exist
fn validate_edge_endpoints(edges: &[Connection], blocks: &[Block], errors: &mut Vec<ValidationError>) {
    let block_ids: HashSet<&str> = blocks.iter().map(|b| b.id.as_str()).collect();

    for edge in edges {
        if !block_ids.contains(edge.from_id.as_str()) {
            errors.push(ValidationError::MissingEndpoint {
                edge_id: edge.id.clone(),
                block_id: edge.from_id.clone(),
                endpoint: Endpoint::Source,
            });
        }
        if !block_ids.contains(edge.to_id.as_str()) {
            errors.push(ValidationError::MissingEndpoint {
                edge_id: edge.id.clone(),
                block_id: edge.to_id.clone(),
                endpoint: Endpoint::Target,
            });
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    OnStack,
    Done,
}

/// Detect cycles using DFS, tracking which blocks are on the current path
///
/// Each back edge reports the blocks between its target and the top of the
/// stack, which is exactly the cycle it closes.
fn detect_cycles(edges: &[Connection], blocks: &[Block], errors: &mut Vec<ValidationError>) {
    let known: HashSet<&str> = blocks.iter().map(|b| b.id.as_str()).collect();

    let mut adjacency: HashMap<&str, Vec<&Connection>> = HashMap::new();
    for edge in edges {
        if known.contains(edge.from_id.as_str()) && known.contains(edge.to_id.as_str()) {
            adjacency.entry(edge.from_id.as_str()).or_default().push(edge);
        }
    }

    let mut visits: HashMap<&str, Visit> = HashMap::new();
    for block in blocks {
        if !visits.contains_key(block.id.as_str()) {
            visit(&block.id, &adjacency, &mut visits, errors);
        }
    }
}

/// Depth-first walk from `root` over an explicit frame stack
fn visit<'a>(
    root: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a Connection>>,
    visits: &mut HashMap<&'a str, Visit>,
    errors: &mut Vec<ValidationError>,
) {
    // (block, index of the next outgoing edge to follow)
    let mut frames: Vec<(&'a str, usize)> = vec![(root, 0)];
    visits.insert(root, Visit::OnStack);

    while let Some(frame) = frames.last_mut() {
        let (block_id, next) = *frame;
        let outgoing = adjacency.get(block_id).map(Vec::as_slice).unwrap_or(&[]);
        let Some(&edge) = outgoing.get(next) else {
            frames.pop();
            visits.insert(block_id, Visit::Done);
            continue;
        };
        frame.1 += 1;

        let target = edge.to_id.as_str();
        match visits.get(target).copied() {
            None => {
                visits.insert(target, Visit::OnStack);
                frames.push((target, 0));
            }
            Some(Visit::OnStack) => {
                let start = frames.iter().position(|(id, _)| *id == target).unwrap_or(0);
                errors.push(ValidationError::CycleDetected {
                    block_ids: frames[start..].iter().map(|(id, _)| id.to_string()).collect(),
                    closing_edge_id: edge.id.clone(),
                    closing_block_id: target.to_string(),
                });
            }
            Some(Visit::Done) => {}
        }
    }
}

fn find_duplicate_edges(edges: &[Connection], warnings: &mut Vec<ValidationWarning>) {
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();
    let mut seen: Vec<((&str, &str), Vec<EdgeId>)> = Vec::new();
    for edge in edges {
        let key = (edge.from_id.as_str(), edge.to_id.as_str());
        match index.get(&key) {
            Some(&i) => seen[i].1.push(edge.id.clone()),
            None => {
                index.insert(key, seen.len());
                seen.push((key, vec![edge.id.clone()]));
            }
        }
    }

    for ((from_id, to_id), edge_ids) in seen {
        if edge_ids.len() > 1 {
            warnings.push(ValidationWarning::DuplicateEdge {
                from_id: from_id.to_string(),
                to_id: to_id.to_string(),
                edge_ids,
            });
        }
    }
}

fn find_isolated_blocks(edges: &[Connection], blocks: &[Block], warnings: &mut Vec<ValidationWarning>) {
    if edges.is_empty() {
        return;
    }
    let connected: HashSet<&str> = edges
        .iter()
        .flat_map(|e| [e.from_id.as_str(), e.to_id.as_str()])
        .collect();

    for block in blocks {
        if !connected.contains(block.id.as_str()) {
            warnings.push(ValidationWarning::IsolatedBlock {
                block_id: block.id.clone(),
            });
        }
    }
}
