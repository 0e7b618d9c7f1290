//! Engine-wide constants
//!
//! Single source of truth for defaults and fixed keys.

/// Batch job queue defaults
pub mod batch {
    /// Concurrent generation workers
    pub const WORKERS: usize = 3;
    /// Failed attempts allowed before a job is marked failed
    pub const MAX_RETRIES: u32 = 3;
    /// Delay before a failed job becomes eligible again (ms)
    pub const RETRY_DELAY_MS: u64 = 2_000;
    /// How long the dispatcher waits before re-checking admission (ms)
    pub const ADMISSION_BACKOFF_MS: u64 = 250;
}

/// Provider rate limits
pub mod rate_limit {
    /// Requests allowed in any sliding one-minute window
    pub const REQUESTS_PER_MINUTE: u32 = 60;
    /// Requests allowed per second (sets the minimum spacing)
    pub const REQUESTS_PER_SECOND: u32 = 2;
    /// Length of the sliding window (ms)
    pub const WINDOW_MS: u64 = 60_000;
}

/// Resource monitor thresholds
pub mod resources {
    /// Process memory share of total memory considered constrained (percent)
    pub const MEMORY_PERCENT: f32 = 85.0;
    /// Process CPU usage considered constrained (percent)
    pub const CPU_PERCENT: f32 = 90.0;
    /// In-flight requests considered constrained
    pub const MAX_CONNECTIONS: usize = 16;
}

/// Completion time predictor tuning
pub mod predictor {
    /// Past runs kept for nearest-neighbour lookup
    pub const HISTORY_WINDOW: usize = 20;
    /// Neighbours blended by the historical estimator
    pub const NEIGHBOURS: usize = 3;
    /// Per-item estimate used when no data is available (ms)
    pub const FALLBACK_ITEM_MS: u64 = 30_000;
}

/// Download orchestrator defaults
pub mod download {
    /// Items started together in concurrent mode
    pub const CHUNK_SIZE: usize = 3;
    /// Failed attempts allowed before an item is marked failed
    pub const MAX_RETRIES: u32 = 3;
    /// Delay before a failed download is retried (ms)
    pub const RETRY_DELAY_MS: u64 = 2_000;
    /// Pause between items in sequential mode (ms)
    pub const SEQUENTIAL_DELAY_MS: u64 = 1_000;
    /// Default destination directory
    pub const DIR: &str = "downloads";
    /// Extension appended when a name has no recognised media extension
    pub const DEFAULT_EXTENSION: &str = "mp4";
    /// Longest file name produced (bytes); leaves room for the `.part` suffix under 255
    pub const NAME_MAX: usize = 250;
    /// Extensions accepted as-is
    pub const MEDIA_EXTENSIONS: &[&str] = &[
        "mp4", "webm", "mov", "mkv", "avi", "png", "jpg", "jpeg", "gif", "webp", "txt", "json",
    ];
}

/// Execution history defaults
pub mod history {
    /// Records kept before the oldest are evicted
    pub const MAX_RECORDS: usize = 100;
    /// Days covered by the daily histogram
    pub const HISTOGRAM_DAYS: i64 = 30;
}

/// Prompt file parsing defaults
pub mod prompt_file {
    /// Shortest accepted prompt after trimming
    pub const MIN_LENGTH: usize = 5;
    /// Prompts kept from one file
    pub const MAX_PROMPTS: usize = 50;
}

/// Graph validation defaults
pub mod graph {
    /// Edge count above which validation warns about complexity
    pub const EDGE_WARNING_THRESHOLD: usize = 50;
}

/// Keys and schema versions for persisted state
pub mod storage {
    /// Key holding the current batch run
    pub const CURRENT_BATCH_KEY: &str = "block_engine.current_batch";
    /// Key holding the execution history list
    pub const EXECUTION_HISTORY_KEY: &str = "block_engine.execution_history";
    /// Schema version written with every persisted value
    pub const SCHEMA_VERSION: u32 = 1;
    /// Name of the engine config file
    pub const CONFIG_FILE: &str = "engine.json";
}
