//! Batch job queue.
//!
//! Turns selected blocks or file prompts into jobs, dispatches them through
//! the rate limiter and resource monitor, retries failures and reports
//! progress.

pub mod consistency;
pub mod processor;
pub mod prompt_file;
pub mod types;

pub use consistency::apply_preamble;
pub use processor::{BatchProcessor, Generator};
pub use prompt_file::{load_prompt_file, parse_prompts, select_prompts, ParsedPrompts};
pub use types::{
    BatchProgress, BatchRequest, BatchRun, BatchSource, BatchStatus, GenerationRequest, Job,
    JobSource, JobStatus, ReferenceArtifact,
};
