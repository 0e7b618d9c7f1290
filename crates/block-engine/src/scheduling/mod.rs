//! Scheduling helpers shared by the batch queue and the downloader.

pub mod predictor;
pub mod rate_limiter;
pub mod resource_monitor;
pub mod retry;

pub use predictor::{
    item_complexity, CompletionPredictor, Estimate, EstimatorKind, Prediction, PredictionInput,
    RunSample,
};
pub use rate_limiter::RateLimiter;
pub use resource_monitor::{
    ConnectionGuard, ResourceMonitor, ResourceProbe, ResourceSample, ResourceSnapshot,
    StaticProbe, SystemProbe,
};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
