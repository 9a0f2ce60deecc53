//! Batch services: source loading, scheduling, persistence

pub mod output;
pub mod scheduler;
pub mod sources;

pub use output::{write_snapshot, StreamWriter};
pub use scheduler::{BatchReport, Pipeline, Scheduler, SchedulerHandle, StopReason};
pub use sources::{extract_candidates, SourceLine, SourceLoader};
