//! Posting pipeline
//!
//! Documents are registered Pending together with a queued job; workers
//! claim jobs, post the journal and move the document to Success or Failed.

pub mod job;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use job::{BackoffStrategy, JobStats, JobStatus, PostingJob, RetryPolicy};
pub use scheduler::{JobScheduler, JobSchedulerConfig, MaintenanceReport};
pub use service::PostingService;
pub use worker::{JobOutcome, PostingError, PostingWorker, WorkerConfig, WorkerPool};
