//! Store module
//!
//! Persistence contracts for the posting engine. Every multi-row write the
//! engine relies on (document submission, posting commit, requeue) is a
//! single store call so implementations can make it one transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    Account, AccountCategory, AccountSubCategory, AccountTransaction, ChartRoleBindings,
    DocumentRecord, DocumentRef, DomainError, Journal, PostingStatus, TransactionType,
};
use crate::pipeline::job::{JobStats, PostingJob};
use crate::seeding::{Budget, OpeningBalance};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Errors raised by a store implementation
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Business rule enforced inside the store (conflict, overpayment, ...)
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Persisted value that no longer decodes
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Transient failures worth another delivery
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => !matches!(
                err,
                sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) | sqlx::Error::TypeNotFound { .. }
            ),
            _ => false,
        }
    }
}

/// Everything one successful posting writes, committed atomically.
#[derive(Debug, Clone)]
pub struct PostingCommit {
    pub journal: Journal,
    pub transaction_type: TransactionType,
}

impl PostingCommit {
    pub fn new(journal: Journal) -> Self {
        let transaction_type = journal.source.kind.transaction_type();
        Self {
            journal,
            transaction_type,
        }
    }

    pub fn document(&self) -> DocumentRef {
        self.journal.source
    }
}

/// A newly registered document together with its settlement and job
#[derive(Debug, Clone)]
pub struct DocumentSubmission {
    pub record: DocumentRecord,
    /// Invoice or bill this document pays, and the amount it settles
    pub settles: Option<(DocumentRef, Decimal)>,
    pub job: PostingJob,
}

/// Chart of accounts persistence
#[async_trait]
pub trait ChartStore: Send + Sync {
    /// Fails with `Conflict` when (group, code) is taken
    async fn insert_category(&self, category: &AccountCategory) -> Result<(), StoreError>;

    async fn get_category(&self, id: Uuid) -> Result<Option<AccountCategory>, StoreError>;

    async fn list_categories(&self, group_id: Uuid) -> Result<Vec<AccountCategory>, StoreError>;

    /// Fails with `Conflict` when (category, code) is taken
    async fn insert_sub_category(&self, sub_category: &AccountSubCategory)
        -> Result<(), StoreError>;

    async fn get_sub_category(&self, id: Uuid) -> Result<Option<AccountSubCategory>, StoreError>;

    async fn find_sub_category_by_code(
        &self,
        group_id: Uuid,
        code: u32,
    ) -> Result<Option<AccountSubCategory>, StoreError>;

    async fn list_sub_categories(
        &self,
        category_id: Uuid,
    ) -> Result<Vec<AccountSubCategory>, StoreError>;

    /// Fails with `Conflict` when (entity, code) is taken
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn find_account_by_code(
        &self,
        entity_id: Uuid,
        code: &str,
    ) -> Result<Option<Account>, StoreError>;

    /// Accounts of an entity ordered by code
    async fn list_accounts(&self, entity_id: Uuid) -> Result<Vec<Account>, StoreError>;

    async fn save_bindings(&self, bindings: &ChartRoleBindings) -> Result<(), StoreError>;

    /// Empty bindings when the entity has none
    async fn load_bindings(&self, entity_id: Uuid) -> Result<ChartRoleBindings, StoreError>;
}

/// Posting status of business documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Register the document as Pending, apply its settlement to the paid
    /// document and enqueue its job, all or nothing.
    ///
    /// Fails with `Conflict` when the document already exists, `NotFound`
    /// when the settled document is unknown, `Overpayment` when the
    /// settlement would exceed the paid document's total.
    async fn submit_document(&self, submission: DocumentSubmission) -> Result<(), StoreError>;

    async fn get_document(&self, document: DocumentRef)
        -> Result<Option<DocumentRecord>, StoreError>;

    /// Compare-and-swap the posting status. Returns false when the document
    /// was not in `from`. Entering Processing counts an attempt.
    async fn transition_status(
        &self,
        document: DocumentRef,
        from: PostingStatus,
        to: PostingStatus,
    ) -> Result<bool, StoreError>;

    /// Processing -> Failed, recording the error. False when not Processing.
    async fn mark_failed(
        &self,
        document: DocumentRef,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, StoreError>;

    /// Failed -> Pending plus a fresh job, atomically. False when not Failed.
    async fn requeue_document(
        &self,
        document: DocumentRef,
        job: PostingJob,
    ) -> Result<bool, StoreError>;

    /// Documents in Processing not touched since `before`
    async fn list_stale_processing(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Failed documents with fewer than `max_attempts` attempts
    async fn list_retryable_failed(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError>;
}

/// Journals, account transactions and balances
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Write the journal, one AccountTransaction per line with the running
    /// balance taken from an atomic increment, and flip the source document
    /// Processing -> Success. Nothing is written on error.
    async fn commit_posting(
        &self,
        commit: PostingCommit,
    ) -> Result<Vec<AccountTransaction>, StoreError>;

    async fn get_journal(&self, id: Uuid) -> Result<Option<Journal>, StoreError>;

    async fn find_journal_by_source(
        &self,
        source: DocumentRef,
    ) -> Result<Option<Journal>, StoreError>;

    /// Transactions of one account in posting order
    async fn list_account_transactions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<AccountTransaction>, StoreError>;

    async fn count_journals(&self, entity_id: Uuid) -> Result<u64, StoreError>;
}

/// Opening balance and budget records
#[async_trait]
pub trait SeedStore: Send + Sync {
    /// Fails with `Conflict` when the entity already has one
    async fn insert_opening_balance(&self, record: &OpeningBalance) -> Result<(), StoreError>;

    async fn get_opening_balance(&self, id: Uuid) -> Result<Option<OpeningBalance>, StoreError>;

    /// Replace a Draft record. False when the stored record is not Draft.
    async fn update_opening_balance(&self, record: &OpeningBalance) -> Result<bool, StoreError>;

    /// Delete a Draft record. False when missing or not Draft.
    async fn delete_opening_balance(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Fails with `Conflict` when (entity, name, fiscal year) is taken
    async fn insert_budget(&self, budget: &Budget) -> Result<(), StoreError>;

    async fn get_budget(&self, id: Uuid) -> Result<Option<Budget>, StoreError>;

    async fn update_budget(&self, budget: &Budget) -> Result<bool, StoreError>;

    async fn delete_budget(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Durable posting job queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &PostingJob) -> Result<(), StoreError>;

    /// Claim the oldest runnable job for `visibility`. Running jobs whose
    /// lock expired are delivered again.
    async fn claim_next(&self, visibility: Duration) -> Result<Option<PostingJob>, StoreError>;

    async fn complete(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Back to Queued until `run_at`
    async fn reschedule(
        &self,
        job_id: Uuid,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Finish without success; `exhausted` marks the job dead
    async fn fail(&self, job_id: Uuid, error: &str, exhausted: bool) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<PostingJob>, StoreError>;

    /// Most recently enqueued job of a document; carries its event payload
    async fn latest_job_for(
        &self,
        document: DocumentRef,
    ) -> Result<Option<PostingJob>, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;

    /// Delete completed jobs last updated before `before`
    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Full store used by the services
pub trait Store: ChartStore + DocumentStore + LedgerStore + SeedStore + JobQueue {}

impl<T> Store for T where T: ChartStore + DocumentStore + LedgerStore + SeedStore + JobQueue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(StoreError::Unavailable("pool timed out".into()).is_retryable());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!StoreError::Domain(DomainError::conflict("code 1100")).is_retryable());
        assert!(!StoreError::Corrupt("status 'x'".into()).is_retryable());
    }
}
