//! Block Engine - Workflow execution for block graphs
//!
//! This crate drives generation over a graph of user-wired blocks. It
//! provides:
//!
//! - Dependency tracking with output propagation along edges
//! - A batch job queue with retries, pause/resume/stop and crash recovery
//! - Rate limiting, resource-aware admission and completion time estimates
//! - Grouped artifact downloads with per-batch and per-execution progress
//! - A durable execution history with statistics and replay
//!
//! # Architecture
//!
//! - `DependencyGraph`: Engine-owned edge table and content cache
//! - `BatchProcessor`: Dispatcher and workers over an injected `Generator`
//! - `DownloadManager`: Chunked or sequential fetches over an `ArtifactFetcher`
//! - `ExecutionHistory`: Capped record list persisted through a `KvStore`
//! - `EventSink`: Progress and artifact notifications to the host
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use block_engine::{BatchProcessor, BatchRequest, BatchConfig};
//! use block_engine::types::Block;
//!
//! let processor = Arc::new(BatchProcessor::new(generator, BatchConfig::default()));
//! processor
//!     .start(BatchRequest::blocks(vec![Block::text("b1", "A01", "a foggy harbour")]))
//!     .await?;
//! ```

pub mod batch;
pub mod config;
pub mod constants;
pub mod download;
pub mod error;
pub mod events;
pub mod graph;
pub mod history;
pub mod scheduling;
pub mod store;
pub mod types;

// Re-export key types
pub use batch::{BatchProcessor, BatchRequest, BatchRun, Generator};
pub use config::{BatchConfig, DownloadConfig, EngineConfig};
pub use download::{ArtifactFetcher, DownloadManager, HttpFetcher};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventSink};
pub use graph::DependencyGraph;
pub use history::ExecutionHistory;
pub use scheduling::{CompletionPredictor, RateLimiter, ResourceMonitor};
pub use store::{FileKvStore, KvStore, MemoryKvStore};
