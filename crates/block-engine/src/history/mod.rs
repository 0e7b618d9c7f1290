//! Execution history: durable records of runs, their per-block outcomes and
//! the configuration used to start them.

pub mod statistics;
pub mod store;
pub mod types;

pub use statistics::{DailyCount, HistoryStatistics};
pub use store::ExecutionHistory;
pub use types::{
    BlockResult, BlockResultStatus, ExecutionConfig, ExecutionRecord, ExecutionStatus,
    HistoryFilter,
};
