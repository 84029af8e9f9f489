//! Job task execution -- one job's walk down its adapter chain.
//!
//! Split into focused submodules:
//! - [`context`] - Per-job state and the terminal transitions (failed, cancelled, retrying)
//! - [`orchestration`] - Chain walking and retry/fallback decisions
//! - [`finalization`] - Verification and atomic promotion into the ingest directory

mod context;
mod finalization;
mod orchestration;

pub(crate) use context::JobContext;
pub(crate) use orchestration::run_job_task;
