//! Completion time prediction.
//!
//! Blends four estimators into one remaining-time figure:
//!
//! - **average**: mean completed item duration, divided across workers
//! - **throughput**: completed items per elapsed second, extrapolated
//! - **historical**: nearest past runs by item count and worker count
//! - **complexity**: time per complexity unit applied to what is left
//!
//! Each estimator only votes when it has data; weights are renormalised over
//! the voters. With no data at all a fixed per-item constant is used.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::constants::predictor::{FALLBACK_ITEM_MS, HISTORY_WINDOW, NEIGHBOURS};
use crate::types::BlockType;

const AVERAGE_WEIGHT: f64 = 0.30;
const THROUGHPUT_WEIGHT: f64 = 0.30;
const HISTORICAL_WEIGHT: f64 = 0.25;
const COMPLEXITY_WEIGHT: f64 = 0.15;

/// Prompt length that adds one complexity unit
const CHARS_PER_UNIT: f64 = 500.0;
const MAX_LENGTH_FACTOR: f64 = 3.0;

/// Relative cost of one item, from its prompt and output kind.
pub fn item_complexity(prompt: &str, kind: BlockType) -> f64 {
    let length = (1.0 + prompt.chars().count() as f64 / CHARS_PER_UNIT).min(MAX_LENGTH_FACTOR);
    length * kind.media_factor()
}

/// Summary of one finished run, kept for historical lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSample {
    pub item_count: usize,
    pub workers: usize,
    pub duration_ms: u64,
}

impl RunSample {
    /// Wall-clock cost per item at this run's concurrency
    fn ms_per_item(&self) -> f64 {
        self.duration_ms as f64 / self.item_count.max(1) as f64
    }

    fn distance(&self, items: usize, workers: usize) -> f64 {
        let rel = |a: usize, b: usize| {
            let hi = a.max(b).max(1) as f64;
            (a as f64 - b as f64).abs() / hi
        };
        rel(self.item_count, items) + rel(self.workers, workers)
    }
}

/// Current state of a run, as seen by the predictor
#[derive(Debug, Clone, Default)]
pub struct PredictionInput {
    pub total_items: usize,
    pub completed_items: usize,
    pub workers: usize,
    pub elapsed: Duration,
    /// Durations of items that finished, in milliseconds
    pub item_durations_ms: Vec<u64>,
    /// Summed complexity of finished items
    pub completed_complexity: f64,
    /// Summed complexity of items still to run
    pub remaining_complexity: f64,
}

impl PredictionInput {
    fn remaining(&self) -> usize {
        self.total_items.saturating_sub(self.completed_items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    Average,
    Throughput,
    Historical,
    Complexity,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    pub kind: EstimatorKind,
    pub remaining_ms: f64,
    pub weight: f64,
}

/// Weighted remaining-time estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub remaining_ms: u64,
    pub estimates: Vec<Estimate>,
}

impl Prediction {
    pub fn is_fallback(&self) -> bool {
        self.estimates
            .iter()
            .all(|e| e.kind == EstimatorKind::Fallback)
    }

    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.remaining_ms)
    }
}

/// Remaining-time estimator with a rolling window of past runs
#[derive(Debug)]
pub struct CompletionPredictor {
    history: Mutex<VecDeque<RunSample>>,
    window: usize,
}

impl Default for CompletionPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionPredictor {
    pub fn new() -> Self {
        Self::with_window(HISTORY_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(window)),
            window: window.max(1),
        }
    }

    /// Remember a finished run; the oldest sample leaves once the window is full
    pub fn record_run(&self, sample: RunSample) {
        if sample.item_count == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.window {
            history.pop_front();
        }
        history.push_back(sample);
    }

    pub fn history(&self) -> Vec<RunSample> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn predict(&self, input: &PredictionInput) -> Prediction {
        let remaining = input.remaining();
        if remaining == 0 {
            return Prediction {
                remaining_ms: 0,
                estimates: Vec::new(),
            };
        }

        let workers = input.workers.max(1) as f64;
        let mut estimates = Vec::with_capacity(4);

        if !input.item_durations_ms.is_empty() {
            let mean = input.item_durations_ms.iter().sum::<u64>() as f64
                / input.item_durations_ms.len() as f64;
            estimates.push(Estimate {
                kind: EstimatorKind::Average,
                remaining_ms: mean * remaining as f64 / workers,
                weight: AVERAGE_WEIGHT,
            });
        }

        let elapsed_ms = input.elapsed.as_secs_f64() * 1000.0;
        if input.completed_items > 0 && elapsed_ms > 0.0 {
            let ms_per_item = elapsed_ms / input.completed_items as f64;
            estimates.push(Estimate {
                kind: EstimatorKind::Throughput,
                remaining_ms: ms_per_item * remaining as f64,
                weight: THROUGHPUT_WEIGHT,
            });
        }

        if let Some(ms_per_item) = self.historical_ms_per_item(input.total_items, input.workers) {
            estimates.push(Estimate {
                kind: EstimatorKind::Historical,
                remaining_ms: ms_per_item * remaining as f64,
                weight: HISTORICAL_WEIGHT,
            });
        }

        if input.completed_complexity > 0.0 && !input.item_durations_ms.is_empty() {
            let per_unit =
                input.item_durations_ms.iter().sum::<u64>() as f64 / input.completed_complexity;
            estimates.push(Estimate {
                kind: EstimatorKind::Complexity,
                remaining_ms: per_unit * input.remaining_complexity / workers,
                weight: COMPLEXITY_WEIGHT,
            });
        }

        if estimates.is_empty() {
            let remaining_ms = remaining as u64 * FALLBACK_ITEM_MS;
            return Prediction {
                remaining_ms,
                estimates: vec![Estimate {
                    kind: EstimatorKind::Fallback,
                    remaining_ms: remaining_ms as f64,
                    weight: 1.0,
                }],
            };
        }

        let total_weight: f64 = estimates.iter().map(|e| e.weight).sum();
        let blended: f64 = estimates
            .iter()
            .map(|e| e.remaining_ms * e.weight)
            .sum::<f64>()
            / total_weight;

        Prediction {
            remaining_ms: blended.max(0.0).round() as u64,
            estimates,
        }
    }

    /// Mean per-item cost of the closest past runs, rescaled to `workers`
    fn historical_ms_per_item(&self, items: usize, workers: usize) -> Option<f64> {
        let history = self.history.lock();
        if history.is_empty() {
            return None;
        }

        let mut ranked: Vec<&RunSample> = history.iter().collect();
        ranked.sort_by(|a, b| {
            a.distance(items, workers)
                .total_cmp(&b.distance(items, workers))
        });

        let workers = workers.max(1) as f64;
        let neighbours = &ranked[..ranked.len().min(NEIGHBOURS)];
        let sum: f64 = neighbours
            .iter()
            .map(|s| s.ms_per_item() * s.workers.max(1) as f64 / workers)
            .sum();
        Some(sum / neighbours.len() as f64)
    }
}
