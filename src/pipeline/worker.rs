//! Posting worker
//!
//! Consume side of the pipeline. A worker claims one job at a time, takes
//! ownership of the document with a Pending -> Processing CAS, builds the
//! journal from the role bindings and commits it atomically.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::domain::{DocumentRef, DomainError, ErrorCategory, Journal, PostingStatus};
use crate::posting::{build_journal, PostingEvent};
use crate::store::{
    ChartStore, DocumentStore, JobQueue, LedgerStore, PostingCommit, Store, StoreError,
};

use super::job::{PostingJob, RetryPolicy};

/// Failure while posting one job
#[derive(Debug, thiserror::Error)]
pub enum PostingError {
    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for PostingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(domain) => PostingError::Domain(domain),
            other => PostingError::Store(other),
        }
    }
}

impl PostingError {
    /// Only infrastructure failures are worth another delivery; bad
    /// configuration or data fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PostingError::Store(err) if err.is_retryable())
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            PostingError::Payload(_) => "invalid_payload",
            PostingError::Domain(err) => err.error_code(),
            PostingError::Store(StoreError::Unavailable(_)) => "store_unavailable",
            PostingError::Store(StoreError::Corrupt(_)) => "corrupt_record",
            PostingError::Store(_) => "database_error",
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, PostingError::Domain(err) if err.category() == ErrorCategory::Configuration)
    }
}

/// What happened to a claimed job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Journal written, document Success
    Posted { journal_id: Uuid },
    /// Document was already Success
    AlreadyPosted,
    /// Another worker owns the document
    Skipped,
    /// Document Failed, job back in the queue
    Retrying { error_code: String },
    /// Document Failed, job finished without retry
    Failed { error_code: String },
    /// Document Failed, job out of attempts
    Dead { error_code: String },
}

/// Worker settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency,
            poll_interval: config.worker_poll_interval,
            visibility_timeout: config.job_visibility_timeout,
            retry: RetryPolicy::exponential(config.job_max_attempts, config.retry_base_delay),
        }
    }
}

/// Ownership check result before posting
enum Claim {
    Owned,
    AlreadyPosted,
    Skipped,
}

/// Processes posting jobs from the store's queue
#[derive(Clone)]
pub struct PostingWorker {
    store: Arc<dyn Store>,
    config: WorkerConfig,
}

impl PostingWorker {
    pub fn new(store: Arc<dyn Store>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    /// Claim and process one job. `None` when the queue has nothing runnable.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, StoreError> {
        let Some(job) = self.store.claim_next(self.config.visibility_timeout).await? else {
            return Ok(None);
        };
        self.process(&job).await.map(Some)
    }

    /// Drain the queue until nothing is runnable; returns the outcomes.
    pub async fn run_until_idle(&self) -> Result<Vec<JobOutcome>, StoreError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_once().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Worker loop; exits when `shutdown` flips to true.
    pub async fn run(self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id, "Posting worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Posting worker queue error");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!(worker_id, "Posting worker stopped");
    }

    async fn process(&self, job: &PostingJob) -> Result<JobOutcome, StoreError> {
        let document = job.document;

        let claim = match self.claim_document(document).await {
            Ok(claim) => claim,
            Err(err) => return self.release(job, err, false).await,
        };

        match claim {
            Claim::AlreadyPosted => {
                tracing::debug!(job_id = %job.id, document_id = %document.id, "Already posted");
                self.store.complete(job.id).await?;
                Ok(JobOutcome::AlreadyPosted)
            }
            Claim::Skipped => {
                tracing::debug!(
                    job_id = %job.id,
                    document_id = %document.id,
                    "Document owned by another worker"
                );
                self.store.complete(job.id).await?;
                Ok(JobOutcome::Skipped)
            }
            Claim::Owned => match self.post(job).await {
                Ok(journal) => {
                    self.store.complete(job.id).await?;
                    tracing::info!(
                        job_id = %job.id,
                        document_id = %document.id,
                        document_kind = %document.kind,
                        journal_id = %journal.id,
                        reference = %journal.reference,
                        "Document posted"
                    );
                    Ok(JobOutcome::Posted {
                        journal_id: journal.id,
                    })
                }
                Err(err) => self.release(job, err, true).await,
            },
        }
    }

    /// Take ownership of the document for this delivery.
    async fn claim_document(&self, document: DocumentRef) -> Result<Claim, PostingError> {
        let record = self
            .store
            .get_document(document)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("document {}", document)))?;

        match record.posting_status {
            PostingStatus::Success => return Ok(Claim::AlreadyPosted),
            PostingStatus::Processing => return Ok(Claim::Skipped),
            PostingStatus::Failed => {
                // Redelivered job after a failed attempt
                if !self
                    .store
                    .transition_status(document, PostingStatus::Failed, PostingStatus::Pending)
                    .await?
                {
                    return Ok(Claim::Skipped);
                }
            }
            PostingStatus::Pending => {}
        }

        if self
            .store
            .transition_status(document, PostingStatus::Pending, PostingStatus::Processing)
            .await?
        {
            Ok(Claim::Owned)
        } else {
            Ok(Claim::Skipped)
        }
    }

    async fn post(&self, job: &PostingJob) -> Result<Journal, PostingError> {
        let event: PostingEvent = job.event()?;
        let bindings = self.store.load_bindings(event.entity_id()).await?;
        let draft = build_journal(&event, &bindings)?;

        let journal = Journal::from_draft(
            draft,
            event.entity_id(),
            job.document,
            event.date(),
            event.description(),
        );
        self.store
            .commit_posting(PostingCommit::new(journal.clone()))
            .await?;
        Ok(journal)
    }

    /// Record a failure on the document (when owned) and decide the job's fate.
    async fn release(
        &self,
        job: &PostingJob,
        err: PostingError,
        owned: bool,
    ) -> Result<JobOutcome, StoreError> {
        let document = job.document;
        let error_code = err.error_code().to_string();
        let message = err.to_string();

        if err.is_configuration() {
            tracing::error!(
                job_id = %job.id,
                document_id = %document.id,
                document_kind = %document.kind,
                error_code = %error_code,
                "Posting blocked by account configuration: {}",
                message
            );
        } else {
            tracing::error!(
                job_id = %job.id,
                document_id = %document.id,
                document_kind = %document.kind,
                error_code = %error_code,
                attempt = job.attempts,
                "Posting failed: {}",
                message
            );
        }

        if owned {
            self.store
                .mark_failed(document, &error_code, &message)
                .await?;
        }

        let exhausted = job.attempts_exhausted() || !self.config.retry.should_retry(job.attempts);
        if err.is_retryable() && !exhausted {
            let run_at = self.config.retry.next_run_at(job.attempts, Utc::now());
            self.store.reschedule(job.id, &message, run_at).await?;
            tracing::warn!(job_id = %job.id, run_at = %run_at, "Posting job rescheduled");
            Ok(JobOutcome::Retrying { error_code })
        } else if err.is_retryable() {
            self.store.fail(job.id, &message, true).await?;
            Ok(JobOutcome::Dead { error_code })
        } else {
            self.store.fail(job.id, &message, false).await?;
            Ok(JobOutcome::Failed { error_code })
        }
    }
}

/// A set of worker tasks sharing one store
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `config.concurrency` workers
    pub fn start(store: Arc<dyn Store>, config: WorkerConfig) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let worker = PostingWorker::new(store, config.clone());

        let handles = (0..config.concurrency.max(1))
            .map(|worker_id| {
                let worker = worker.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move { worker.run(worker_id, receiver).await })
            })
            .collect();

        tracing::info!(workers = config.concurrency, "Posting worker pool started");
        Self { handles, shutdown }
    }

    /// Signal every worker and wait for the in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Posting worker task panicked");
            }
        }
        tracing::info!("Posting worker pool stopped");
    }
}
