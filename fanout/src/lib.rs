//! fanout: bounded concurrency primitives.
//!
//! - [`jobs`]: run N jobs with at most C workers (fail-fast, fail-continue,
//!   and result-merging flavours).
//! - [`inflight`]: single-flight admission per token under a global limit.
//! - [`pool`]: fire-and-forget closures on reusable worker threads.

pub mod config;
pub mod context;
pub mod error;
pub mod inflight;
pub mod jobs;
pub mod pool;

pub use config::Limits;
pub use context::{CancelGuard, CancellationToken, Context};
pub use error::{ContextError, Error, MultiError, Result};
pub use inflight::InflightController;
pub use jobs::{run_for_keys, run_jobs, run_jobs_collect};
pub use pool::WorkerPool;
