//! Scheduled Jobs
//!
//! Periodic maintenance of the posting pipeline: failing documents a dead
//! worker left in Processing, scheduled retry of failed postings, and
//! cleanup of finished jobs.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::config::Config;
use crate::domain::DocumentRecord;
use crate::pipeline::job::{chrono_duration, JobStatus, PostingJob};
use crate::store::{Store, StoreError};

/// Error code stored on documents failed by the stale check
pub const STALE_PROCESSING: &str = "stale_processing";

// =========================================================================
// Stuck document reset
// =========================================================================

/// Fail documents stuck in Processing longer than `stale_after`.
/// The CAS in `mark_failed` leaves documents alone that finished meanwhile.
pub async fn requeue_stuck_documents(
    store: &dyn Store,
    stale_after: Duration,
) -> Result<u64, JobError> {
    let before = Utc::now() - chrono_duration(stale_after);
    let stale = store.list_stale_processing(before).await?;

    let mut reset = 0;
    for record in &stale {
        let message = format!(
            "posting did not finish within {}s",
            stale_after.as_secs()
        );
        if store
            .mark_failed(record.reference, STALE_PROCESSING, &message)
            .await?
        {
            reset += 1;
        }
    }

    if reset > 0 {
        tracing::warn!(rows_affected = reset, "Reset stale processing documents");
    }

    Ok(reset)
}

// =========================================================================
// Scheduled retry
// =========================================================================

/// Put failed documents with attempts left back into the queue.
///
/// Documents whose last job is still queued or running are skipped: that
/// job already retries them.
pub async fn retry_failed_documents(
    store: &dyn Store,
    max_attempts: u32,
    batch_size: usize,
) -> Result<u64, JobError> {
    let failed = store.list_retryable_failed(max_attempts, batch_size).await?;

    let mut requeued = 0;
    for record in &failed {
        if requeue_failed(store, record, max_attempts).await? {
            requeued += 1;
        }
    }

    if requeued > 0 {
        tracing::info!(rows_affected = requeued, "Requeued failed postings");
    }

    Ok(requeued)
}

async fn requeue_failed(
    store: &dyn Store,
    record: &DocumentRecord,
    max_attempts: u32,
) -> Result<bool, JobError> {
    let Some(previous) = store.latest_job_for(record.reference).await? else {
        tracing::warn!(
            document_id = %record.reference.id,
            document_kind = %record.reference.kind,
            "Failed document has no stored payload"
        );
        return Ok(false);
    };

    if matches!(previous.status, JobStatus::Queued | JobStatus::Running) {
        return Ok(false);
    }

    let job = PostingJob::for_event(&previous.event()?, max_attempts)?;
    Ok(store.requeue_document(record.reference, job).await?)
}

// =========================================================================
// Finished job cleanup
// =========================================================================

/// Delete completed jobs older than `retention`
pub async fn purge_finished_jobs(store: &dyn Store, retention: Duration) -> Result<u64, JobError> {
    let before = Utc::now() - chrono_duration(retention);
    let rows_deleted = store.purge_completed(before).await?;

    if rows_deleted > 0 {
        tracing::info!(rows_deleted = rows_deleted, "Purged completed posting jobs");
    }

    Ok(rows_deleted)
}

// =========================================================================
// Job Scheduler
// =========================================================================

/// Configuration for job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval for the stale Processing check (default: 1 minute)
    pub stale_check_interval: Duration,
    /// Interval for scheduled retry (default: 30 seconds)
    pub retry_interval: Duration,
    /// Interval for job cleanup (default: 1 hour)
    pub purge_interval: Duration,
    /// Processing documents older than this are failed
    pub stale_processing_after: Duration,
    /// Completed jobs kept this long
    pub completed_job_retention: Duration,
    /// Document attempts before scheduled retry gives up
    pub max_attempts: u32,
    /// Failed documents requeued per tick
    pub retry_batch_size: usize,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            stale_check_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(30),
            purge_interval: Duration::from_secs(3600),
            stale_processing_after: Duration::from_secs(300),
            completed_job_retention: Duration::from_secs(72 * 3600),
            max_attempts: 5,
            retry_batch_size: 100,
        }
    }
}

impl From<&Config> for JobSchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            stale_processing_after: config.stale_processing_after,
            completed_job_retention: config.completed_job_retention,
            max_attempts: config.job_max_attempts,
            ..Self::default()
        }
    }
}

/// Job Scheduler - runs periodic pipeline maintenance
pub struct JobScheduler {
    store: Arc<dyn Store>,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            config: JobSchedulerConfig::default(),
        }
    }

    pub fn with_config(store: Arc<dyn Store>, config: JobSchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        tracing::info!("Job scheduler started");

        let store = self.store.as_ref();
        let mut stale_interval = interval(self.config.stale_check_interval);
        let mut retry_interval = interval(self.config.retry_interval);
        let mut purge_interval = interval(self.config.purge_interval);

        loop {
            tokio::select! {
                _ = stale_interval.tick() => {
                    if let Err(e) = requeue_stuck_documents(store, self.config.stale_processing_after).await {
                        tracing::error!(error = %e, "Stale document reset failed");
                    }
                }
                _ = retry_interval.tick() => {
                    if let Err(e) = retry_failed_documents(
                        store,
                        self.config.max_attempts,
                        self.config.retry_batch_size,
                    ).await {
                        tracing::error!(error = %e, "Scheduled retry failed");
                    }
                }
                _ = purge_interval.tick() => {
                    if let Err(e) = purge_finished_jobs(store, self.config.completed_job_retention).await {
                        tracing::error!(error = %e, "Job cleanup failed");
                    }
                }
            }
        }
    }

    /// Run all maintenance jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let store = self.store.as_ref();
        let mut report = MaintenanceReport::default();

        match requeue_stuck_documents(store, self.config.stale_processing_after).await {
            Ok(count) => report.stale_documents_failed = count,
            Err(e) => report.errors.push(format!("Stale document reset: {}", e)),
        }

        match retry_failed_documents(store, self.config.max_attempts, self.config.retry_batch_size)
            .await
        {
            Ok(count) => report.documents_requeued = count,
            Err(e) => report.errors.push(format!("Scheduled retry: {}", e)),
        }

        match purge_finished_jobs(store, self.config.completed_job_retention).await {
            Ok(count) => report.jobs_purged = count,
            Err(e) => report.errors.push(format!("Job cleanup: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub stale_documents_failed: u64,
    pub documents_requeued: u64,
    pub jobs_purged: u64,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DocumentRecord, DocumentRef, PostingStatus};
    use crate::posting::{CashReceipt, ItemKind, PostingEvent, SaleLine};
    use crate::store::{DocumentStore, DocumentSubmission, InMemoryStore, JobQueue};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn failed_receipt(store: &InMemoryStore) -> DocumentRef {
        let entity_id = Uuid::new_v4();
        let event = PostingEvent::CashReceipt(CashReceipt {
            receipt_id: Uuid::new_v4(),
            entity_id,
            number: "RCP-1".into(),
            date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            deposit_account_id: Uuid::new_v4(),
            items: vec![SaleLine {
                kind: ItemKind::Service,
                net: dec!(100),
                tax: dec!(0),
            }],
        });
        let job = PostingJob::for_event(&event, 5).unwrap();
        let job_id = job.id;
        let reference = event.document();
        store
            .submit_document(DocumentSubmission {
                record: DocumentRecord::pending(reference, entity_id, dec!(100)),
                settles: None,
                job,
            })
            .await
            .unwrap();
        store
            .transition_status(reference, PostingStatus::Pending, PostingStatus::Processing)
            .await
            .unwrap();
        store.mark_failed(reference, "invalid_amount", "bad").await.unwrap();
        store.fail(job_id, "bad", false).await.unwrap();
        reference
    }

    #[test]
    fn test_job_scheduler_config_default() {
        let config = JobSchedulerConfig::default();
        assert_eq!(config.stale_check_interval, Duration::from_secs(60));
        assert_eq!(config.purge_interval, Duration::from_secs(3600));
        assert_eq!(config.max_attempts, 5);
    }

    #[tokio::test]
    async fn test_retry_failed_documents_requeues_once() {
        let store = Arc::new(InMemoryStore::new());
        let reference = failed_receipt(&store).await;

        assert_eq!(retry_failed_documents(store.as_ref(), 5, 10).await.unwrap(), 1);
        let record = store.get_document(reference).await.unwrap().unwrap();
        assert_eq!(record.posting_status, PostingStatus::Pending);

        // Fresh job queued; nothing left to retry
        assert_eq!(store.stats().await.unwrap().queued, 1);
        assert_eq!(retry_failed_documents(store.as_ref(), 5, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_respects_attempt_limit() {
        let store = Arc::new(InMemoryStore::new());
        failed_receipt(&store).await;

        // One attempt used, limit of one: nothing to do
        assert_eq!(retry_failed_documents(store.as_ref(), 1, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_processing_documents_are_failed() {
        let store = Arc::new(InMemoryStore::new());
        let reference = failed_receipt(&store).await;
        store
            .transition_status(reference, PostingStatus::Failed, PostingStatus::Pending)
            .await
            .unwrap();
        store
            .transition_status(reference, PostingStatus::Pending, PostingStatus::Processing)
            .await
            .unwrap();

        assert_eq!(
            requeue_stuck_documents(store.as_ref(), Duration::from_secs(300))
                .await
                .unwrap(),
            0
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            requeue_stuck_documents(store.as_ref(), Duration::ZERO).await.unwrap(),
            1
        );

        let record = store.get_document(reference).await.unwrap().unwrap();
        assert_eq!(record.posting_status, PostingStatus::Failed);
        assert_eq!(record.error_code.as_deref(), Some(STALE_PROCESSING));
    }

    #[tokio::test]
    async fn test_run_all_once_reports() {
        let store = Arc::new(InMemoryStore::new());
        failed_receipt(&store).await;

        let scheduler = JobScheduler::new(store.clone());
        let report = scheduler.run_all_once().await;
        assert!(report.errors.is_empty());
        assert_eq!(report.documents_requeued, 1);
        assert_eq!(report.jobs_purged, 0);
    }
}
