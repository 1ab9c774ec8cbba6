//! Shared data model for the Job Forge job-processing substrate.
//!
//! This crate has no I/O of its own: it defines the types that flow
//! between the durable store, the worker pool, and the submission backend,
//! plus the hashing and error-categorization rules that keep those
//! components consistent with each other.

pub mod cache;
pub mod error;
pub mod hashing;
pub mod job;
pub mod operation;
pub mod time;
pub mod worker;

pub use cache::{IssueKind, IssueRow, QueueCacheRow, ResultCacheRow};
pub use error::{CategorizedError, ErrorKind};
pub use job::{Job, JobId, JobStatus, JobType};
pub use operation::{Operation, Payload};
pub use time::Clock;
pub use worker::{ExecutionMode, Worker, WorkerId, WorkerStatus};
