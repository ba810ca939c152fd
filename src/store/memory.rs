//! In-memory store
//!
//! Every operation runs under one mutex, which makes each trait call
//! atomic. Used by tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    Account, AccountCategory, AccountSubCategory, AccountTransaction, ChartRoleBindings,
    DocumentRecord, DocumentRef, DomainError, Journal, PostingStatus,
};
use crate::pipeline::job::{JobStats, JobStatus, PostingJob};
use crate::posting::check_settlement;
use crate::seeding::{Budget, OpeningBalance, SeedStatus};

use super::{
    ChartStore, DocumentStore, DocumentSubmission, JobQueue, LedgerStore, PostingCommit,
    SeedStore, StoreError,
};

#[derive(Default)]
struct State {
    categories: HashMap<Uuid, AccountCategory>,
    sub_categories: HashMap<Uuid, AccountSubCategory>,
    accounts: HashMap<Uuid, Account>,
    bindings: HashMap<Uuid, ChartRoleBindings>,
    documents: HashMap<DocumentRef, DocumentRecord>,
    journals: HashMap<Uuid, Journal>,
    journal_sources: HashMap<DocumentRef, Uuid>,
    /// Append-only, in posting order
    transactions: Vec<AccountTransaction>,
    opening_balances: HashMap<Uuid, OpeningBalance>,
    budgets: HashMap<Uuid, Budget>,
    /// In enqueue order
    jobs: Vec<PostingJob>,
}

/// Mutex-guarded store
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    failing_commits: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` posting commits fail as unavailable.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn sorted_by_code<T: Clone>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> String) -> Vec<T> {
    let mut items: Vec<T> = items.collect();
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl ChartStore for InMemoryStore {
    async fn insert_category(&self, category: &AccountCategory) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state
            .categories
            .values()
            .any(|c| c.group_id == category.group_id && c.code == category.code)
        {
            return Err(DomainError::conflict(format!(
                "category code {} already exists in this group",
                category.code
            ))
            .into());
        }
        state.categories.insert(category.id, category.clone());
        Ok(())
    }

    async fn get_category(&self, id: Uuid) -> Result<Option<AccountCategory>, StoreError> {
        Ok(self.lock()?.categories.get(&id).cloned())
    }

    async fn list_categories(&self, group_id: Uuid) -> Result<Vec<AccountCategory>, StoreError> {
        let state = self.lock()?;
        let mut categories: Vec<_> = state
            .categories
            .values()
            .filter(|c| c.group_id == group_id)
            .cloned()
            .collect();
        categories.sort_by_key(|c| c.code);
        Ok(categories)
    }

    async fn insert_sub_category(
        &self,
        sub_category: &AccountSubCategory,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.sub_categories.values().any(|s| {
            s.code == sub_category.code
                && (s.category_id == sub_category.category_id
                    || s.group_id == sub_category.group_id)
        }) {
            return Err(DomainError::conflict(format!(
                "sub-category code {} already exists in this category",
                sub_category.code
            ))
            .into());
        }
        state
            .sub_categories
            .insert(sub_category.id, sub_category.clone());
        Ok(())
    }

    async fn get_sub_category(&self, id: Uuid) -> Result<Option<AccountSubCategory>, StoreError> {
        Ok(self.lock()?.sub_categories.get(&id).cloned())
    }

    async fn find_sub_category_by_code(
        &self,
        group_id: Uuid,
        code: u32,
    ) -> Result<Option<AccountSubCategory>, StoreError> {
        Ok(self
            .lock()?
            .sub_categories
            .values()
            .find(|s| s.group_id == group_id && s.code == code)
            .cloned())
    }

    async fn list_sub_categories(
        &self,
        category_id: Uuid,
    ) -> Result<Vec<AccountSubCategory>, StoreError> {
        let state = self.lock()?;
        let mut subs: Vec<_> = state
            .sub_categories
            .values()
            .filter(|s| s.category_id == category_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.code);
        Ok(subs)
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state
            .accounts
            .values()
            .any(|a| a.entity_id == account.entity_id && a.code == account.code)
        {
            return Err(DomainError::conflict(format!(
                "account code {} already exists in this entity",
                account.code
            ))
            .into());
        }
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.lock()?.accounts.get(&id).cloned())
    }

    async fn find_account_by_code(
        &self,
        entity_id: Uuid,
        code: &str,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self
            .lock()?
            .accounts
            .values()
            .find(|a| a.entity_id == entity_id && a.code == code)
            .cloned())
    }

    async fn list_accounts(&self, entity_id: Uuid) -> Result<Vec<Account>, StoreError> {
        let state = self.lock()?;
        Ok(sorted_by_code(
            state
                .accounts
                .values()
                .filter(|a| a.entity_id == entity_id)
                .cloned(),
            |a| a.code.clone(),
        ))
    }

    async fn save_bindings(&self, bindings: &ChartRoleBindings) -> Result<(), StoreError> {
        self.lock()?
            .bindings
            .insert(bindings.entity_id, bindings.clone());
        Ok(())
    }

    async fn load_bindings(&self, entity_id: Uuid) -> Result<ChartRoleBindings, StoreError> {
        Ok(self
            .lock()?
            .bindings
            .get(&entity_id)
            .cloned()
            .unwrap_or_else(|| ChartRoleBindings::new(entity_id)))
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn submit_document(&self, submission: DocumentSubmission) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let record = submission.record;

        if state.documents.contains_key(&record.reference) {
            return Err(DomainError::conflict(format!(
                "document {} already submitted",
                record.reference
            ))
            .into());
        }

        if let Some((target_ref, amount)) = submission.settles {
            let target = state
                .documents
                .get_mut(&target_ref)
                .ok_or_else(|| DomainError::not_found(format!("document {}", target_ref)))?;
            if target.entity_id != record.entity_id {
                return Err(DomainError::BusinessRuleViolation(format!(
                    "{} belongs to another entity",
                    target_ref
                ))
                .into());
            }
            check_settlement(target.total, target.amount_settled, amount)?;
            target.amount_settled += amount;
            target.updated_at = Utc::now();
        }

        state.documents.insert(record.reference, record);
        state.jobs.push(submission.job);
        Ok(())
    }

    async fn get_document(
        &self,
        document: DocumentRef,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.lock()?.documents.get(&document).cloned())
    }

    async fn transition_status(
        &self,
        document: DocumentRef,
        from: PostingStatus,
        to: PostingStatus,
    ) -> Result<bool, StoreError> {
        from.transition(to)?;
        let mut state = self.lock()?;
        let record = state
            .documents
            .get_mut(&document)
            .ok_or_else(|| DomainError::not_found(format!("document {}", document)))?;

        if record.posting_status != from {
            return Ok(false);
        }
        record.posting_status = to;
        if to == PostingStatus::Processing {
            record.attempts += 1;
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_failed(
        &self,
        document: DocumentRef,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(record) = state.documents.get_mut(&document) else {
            return Ok(false);
        };
        if record.posting_status != PostingStatus::Processing {
            return Ok(false);
        }
        record.posting_status = PostingStatus::Failed;
        record.error_code = Some(error_code.to_string());
        record.error_message = Some(error_message.to_string());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn requeue_document(
        &self,
        document: DocumentRef,
        job: PostingJob,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(record) = state.documents.get_mut(&document) else {
            return Err(DomainError::not_found(format!("document {}", document)).into());
        };
        if record.posting_status != PostingStatus::Failed {
            return Ok(false);
        }
        record.posting_status = PostingStatus::Pending;
        record.updated_at = Utc::now();
        state.jobs.push(job);
        Ok(true)
    }

    async fn list_stale_processing(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        Ok(self
            .lock()?
            .documents
            .values()
            .filter(|d| d.posting_status == PostingStatus::Processing && d.updated_at < before)
            .cloned()
            .collect())
    }

    async fn list_retryable_failed(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        let state = self.lock()?;
        let mut failed: Vec<_> = state
            .documents
            .values()
            .filter(|d| {
                d.posting_status == PostingStatus::Failed && (d.attempts as i64) < max_attempts as i64
            })
            .cloned()
            .collect();
        failed.sort_by_key(|d| d.updated_at);
        failed.truncate(limit);
        Ok(failed)
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn commit_posting(
        &self,
        commit: PostingCommit,
    ) -> Result<Vec<AccountTransaction>, StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }

        let mut state = self.lock()?;
        let journal = commit.journal;
        let source = journal.source;

        let status = state
            .documents
            .get(&source)
            .map(|d| d.posting_status)
            .ok_or_else(|| DomainError::not_found(format!("document {}", source)))?;
        if status != PostingStatus::Processing {
            return Err(DomainError::InvalidStatusTransition {
                from: status,
                to: PostingStatus::Success,
            }
            .into());
        }
        if state.journal_sources.contains_key(&source) {
            return Err(DomainError::conflict(format!("{} is already posted", source)).into());
        }

        // Validate every line before writing anything
        for line in &journal.lines {
            match state.accounts.get(&line.account_id()) {
                Some(account) if account.entity_id == journal.entity_id => {}
                Some(_) => return Err(DomainError::AccountNotInEntity(line.account_id()).into()),
                None => {
                    return Err(
                        DomainError::not_found(format!("account {}", line.account_id())).into(),
                    )
                }
            }
        }

        let mut rows = Vec::with_capacity(journal.lines.len());
        for line in &journal.lines {
            let account = state
                .accounts
                .get_mut(&line.account_id())
                .ok_or_else(|| DomainError::not_found(format!("account {}", line.account_id())))?;
            account.balance += account
                .normal_balance
                .delta(line.debit_amount(), line.credit_amount());

            rows.push(AccountTransaction {
                id: Uuid::new_v4(),
                journal_id: journal.id,
                entity_id: journal.entity_id,
                account_id: line.account_id(),
                debit: line.debit_amount(),
                credit: line.credit_amount(),
                running_balance: account.balance,
                transaction_type: commit.transaction_type,
                status: PostingStatus::Success,
                related: source,
                created_at: journal.created_at,
            });
        }

        if let Some(record) = state.documents.get_mut(&source) {
            record.posting_status = PostingStatus::Success;
            record.journal_id = Some(journal.id);
            record.journal_reference = Some(journal.reference.clone());
            record.posted_at = Some(journal.created_at);
            record.error_code = None;
            record.error_message = None;
            record.updated_at = Utc::now();
        }

        state.transactions.extend(rows.iter().cloned());
        state.journal_sources.insert(source, journal.id);
        state.journals.insert(journal.id, journal);
        Ok(rows)
    }

    async fn get_journal(&self, id: Uuid) -> Result<Option<Journal>, StoreError> {
        Ok(self.lock()?.journals.get(&id).cloned())
    }

    async fn find_journal_by_source(
        &self,
        source: DocumentRef,
    ) -> Result<Option<Journal>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .journal_sources
            .get(&source)
            .and_then(|id| state.journals.get(id))
            .cloned())
    }

    async fn list_account_transactions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<AccountTransaction>, StoreError> {
        Ok(self
            .lock()?
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn count_journals(&self, entity_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .lock()?
            .journals
            .values()
            .filter(|j| j.entity_id == entity_id)
            .count() as u64)
    }
}

#[async_trait]
impl SeedStore for InMemoryStore {
    async fn insert_opening_balance(&self, record: &OpeningBalance) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state
            .opening_balances
            .values()
            .any(|o| o.entity_id == record.entity_id)
        {
            return Err(DomainError::conflict(format!(
                "entity {} already has an opening balance",
                record.entity_id
            ))
            .into());
        }
        state.opening_balances.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_opening_balance(&self, id: Uuid) -> Result<Option<OpeningBalance>, StoreError> {
        Ok(self.lock()?.opening_balances.get(&id).cloned())
    }

    async fn update_opening_balance(&self, record: &OpeningBalance) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.opening_balances.get_mut(&record.id) {
            Some(stored) if stored.status == SeedStatus::Draft => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_opening_balance(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.opening_balances.get(&id) {
            Some(stored) if stored.status == SeedStatus::Draft => {
                state.opening_balances.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_budget(&self, budget: &Budget) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.budgets.values().any(|b| {
            b.entity_id == budget.entity_id
                && b.name == budget.name
                && b.fiscal_year == budget.fiscal_year
        }) {
            return Err(DomainError::conflict(format!(
                "budget '{}' for {} already exists",
                budget.name, budget.fiscal_year
            ))
            .into());
        }
        state.budgets.insert(budget.id, budget.clone());
        Ok(())
    }

    async fn get_budget(&self, id: Uuid) -> Result<Option<Budget>, StoreError> {
        Ok(self.lock()?.budgets.get(&id).cloned())
    }

    async fn update_budget(&self, budget: &Budget) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.budgets.get_mut(&budget.id) {
            Some(stored) if stored.status == SeedStatus::Draft => {
                *stored = budget.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_budget(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.budgets.get(&id) {
            Some(stored) if stored.status == SeedStatus::Draft => {
                state.budgets.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryStore {
    async fn enqueue(&self, job: &PostingJob) -> Result<(), StoreError> {
        self.lock()?.jobs.push(job.clone());
        Ok(())
    }

    async fn claim_next(&self, visibility: Duration) -> Result<Option<PostingJob>, StoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let next = state
            .jobs
            .iter_mut()
            .filter(|job| job.is_claimable(now))
            .min_by_key(|job| (job.run_at, job.created_at));

        Ok(next.map(|job| {
            job.mark_claimed(now, visibility);
            job.clone()
        }))
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.update_job(job_id, |job| {
            job.status = JobStatus::Completed;
            job.locked_until = None;
        })
    }

    async fn reschedule(
        &self,
        job_id: Uuid,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_job(job_id, |job| {
            job.status = JobStatus::Queued;
            job.run_at = run_at;
            job.locked_until = None;
            job.last_error = Some(error.to_string());
        })
    }

    async fn fail(&self, job_id: Uuid, error: &str, exhausted: bool) -> Result<(), StoreError> {
        self.update_job(job_id, |job| {
            job.status = if exhausted {
                JobStatus::Dead
            } else {
                JobStatus::Failed
            };
            job.locked_until = None;
            job.last_error = Some(error.to_string());
        })
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<PostingJob>, StoreError> {
        Ok(self.lock()?.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn latest_job_for(
        &self,
        document: DocumentRef,
    ) -> Result<Option<PostingJob>, StoreError> {
        Ok(self
            .lock()?
            .jobs
            .iter()
            .rev()
            .find(|j| j.document == document)
            .cloned())
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        for job in &state.jobs {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let len = state.jobs.len();
        state
            .jobs
            .retain(|job| !(job.status == JobStatus::Completed && job.updated_at < before));
        Ok((len - state.jobs.len()) as u64)
    }
}

impl InMemoryStore {
    fn update_job(&self, job_id: Uuid, apply: impl FnOnce(&mut PostingJob)) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| DomainError::not_found(format!("job {}", job_id)))?;
        apply(job);
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Sum of all account balances of an entity, per normal side
    pub fn balance_totals(&self, entity_id: Uuid) -> Result<(Decimal, Decimal), StoreError> {
        let state = self.lock()?;
        let mut debit_side = Decimal::ZERO;
        let mut credit_side = Decimal::ZERO;
        for account in state.accounts.values().filter(|a| a.entity_id == entity_id) {
            match account.normal_balance {
                crate::domain::NormalBalance::Debit => debit_side += account.balance,
                crate::domain::NormalBalance::Credit => credit_side += account.balance,
            }
        }
        Ok((debit_side, credit_side))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountType, DocumentKind, JournalDraft, JournalLine};
    use crate::posting::{BillPayment, PostingEvent};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn account(entity_id: Uuid, account_type: AccountType, code: &str) -> Account {
        let sub = AccountSubCategory {
            id: Uuid::new_v4(),
            group_id: Uuid::nil(),
            category_id: Uuid::new_v4(),
            account_type,
            code: account_type.code() + 110,
            name: "sub".into(),
            created_at: Utc::now(),
        };
        Account::open(entity_id, &sub, code.into(), code.into())
    }

    fn job_for(document: DocumentRef, entity_id: Uuid) -> PostingJob {
        let event = PostingEvent::BillPayment(BillPayment {
            payment_id: document.id,
            entity_id,
            bill_id: Uuid::new_v4(),
            number: "BPY-1".into(),
            date: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
            amount: "10".parse().unwrap(),
            paying_account_id: Uuid::new_v4(),
        });
        PostingJob::for_event(&event, 3).unwrap()
    }

    async fn processing_document(store: &InMemoryStore, entity_id: Uuid) -> DocumentRef {
        let reference = DocumentRef::new(DocumentKind::Receipt, Uuid::new_v4());
        store
            .submit_document(DocumentSubmission {
                record: DocumentRecord::pending(reference, entity_id, dec!(100)),
                settles: None,
                job: job_for(reference, entity_id),
            })
            .await
            .unwrap();
        assert!(store
            .transition_status(reference, PostingStatus::Pending, PostingStatus::Processing)
            .await
            .unwrap());
        reference
    }

    fn journal(entity_id: Uuid, source: DocumentRef, debit: Uuid, credit: Uuid) -> Journal {
        let draft = JournalDraft::from_lines(vec![
            JournalLine::debit(debit, dec!(100)).unwrap(),
            JournalLine::credit(credit, dec!(100)).unwrap(),
        ])
        .unwrap();
        Journal::from_draft(
            draft,
            entity_id,
            source,
            NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
            "test".into(),
        )
    }

    #[tokio::test]
    async fn test_commit_posting_updates_balances() {
        let store = InMemoryStore::new();
        let entity_id = Uuid::new_v4();
        let cash = account(entity_id, AccountType::Assets, "1110-01");
        let revenue = account(entity_id, AccountType::Revenue, "4120-01");
        store.insert_account(&cash).await.unwrap();
        store.insert_account(&revenue).await.unwrap();

        let source = processing_document(&store, entity_id).await;
        let rows = store
            .commit_posting(PostingCommit::new(journal(
                entity_id, source, cash.id, revenue.id,
            )))
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.running_balance == dec!(100)));
        let doc = store.get_document(source).await.unwrap().unwrap();
        assert_eq!(doc.posting_status, PostingStatus::Success);
        assert!(doc.journal_reference.unwrap().starts_with("JV-RCT-"));
        assert_eq!(store.balance_totals(entity_id).unwrap(), (dec!(100), dec!(100)));
    }

    #[tokio::test]
    async fn test_commit_posting_writes_nothing_on_unknown_account() {
        let store = InMemoryStore::new();
        let entity_id = Uuid::new_v4();
        let cash = account(entity_id, AccountType::Assets, "1110-01");
        store.insert_account(&cash).await.unwrap();

        let source = processing_document(&store, entity_id).await;
        let result = store
            .commit_posting(PostingCommit::new(journal(
                entity_id,
                source,
                cash.id,
                Uuid::new_v4(),
            )))
            .await;

        assert!(matches!(
            result,
            Err(StoreError::Domain(DomainError::NotFound(_)))
        ));
        assert_eq!(store.get_account(cash.id).await.unwrap().unwrap().balance, dec!(0));
        assert!(store.list_account_transactions(cash.id).await.unwrap().is_empty());
        assert_eq!(store.count_journals(entity_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_requires_processing() {
        let store = InMemoryStore::new();
        let entity_id = Uuid::new_v4();
        let cash = account(entity_id, AccountType::Assets, "1110-01");
        let revenue = account(entity_id, AccountType::Revenue, "4120-01");
        store.insert_account(&cash).await.unwrap();
        store.insert_account(&revenue).await.unwrap();

        let source = processing_document(&store, entity_id).await;
        store
            .commit_posting(PostingCommit::new(journal(
                entity_id, source, cash.id, revenue.id,
            )))
            .await
            .unwrap();

        let second = store
            .commit_posting(PostingCommit::new(journal(
                entity_id, source, cash.id, revenue.id,
            )))
            .await;
        assert!(matches!(
            second,
            Err(StoreError::Domain(DomainError::InvalidStatusTransition { .. }))
        ));
        assert_eq!(store.count_journals(entity_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_cas() {
        let store = InMemoryStore::new();
        let entity_id = Uuid::new_v4();
        let source = processing_document(&store, entity_id).await;

        // Already Processing: a second pickup loses the swap
        let lost = store
            .transition_status(source, PostingStatus::Pending, PostingStatus::Processing)
            .await
            .unwrap();
        assert!(!lost);

        let illegal = store
            .transition_status(source, PostingStatus::Processing, PostingStatus::Pending)
            .await;
        assert!(illegal.is_err());

        assert!(store.mark_failed(source, "x", "boom").await.unwrap());
        let doc = store.get_document(source).await.unwrap().unwrap();
        assert_eq!(doc.posting_status, PostingStatus::Failed);
        assert_eq!(doc.attempts, 1);
        assert_eq!(doc.error_code.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_settlement_overpayment_rejected_atomically() {
        let store = InMemoryStore::new();
        let entity_id = Uuid::new_v4();
        let invoice = DocumentRef::new(DocumentKind::Invoice, Uuid::new_v4());
        store
            .submit_document(DocumentSubmission {
                record: DocumentRecord::pending(invoice, entity_id, dec!(1000)),
                settles: None,
                job: job_for(invoice, entity_id),
            })
            .await
            .unwrap();

        let first = DocumentRef::new(DocumentKind::PaymentReceived, Uuid::new_v4());
        store
            .submit_document(DocumentSubmission {
                record: DocumentRecord::pending(first, entity_id, dec!(1000)),
                settles: Some((invoice, dec!(1000))),
                job: job_for(first, entity_id),
            })
            .await
            .unwrap();

        let second = DocumentRef::new(DocumentKind::PaymentReceived, Uuid::new_v4());
        let result = store
            .submit_document(DocumentSubmission {
                record: DocumentRecord::pending(second, entity_id, dec!(1)),
                settles: Some((invoice, dec!(1))),
                job: job_for(second, entity_id),
            })
            .await;

        assert!(matches!(
            result,
            Err(StoreError::Domain(DomainError::Overpayment { .. }))
        ));
        assert!(store.get_document(second).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn test_claim_visibility_and_redelivery() {
        let store = InMemoryStore::new();
        let document = DocumentRef::new(DocumentKind::PaymentMade, Uuid::new_v4());
        let job = job_for(document, Uuid::new_v4());
        store.enqueue(&job).await.unwrap();

        let claimed = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.attempts, 1);
        assert!(store.claim_next(Duration::from_secs(60)).await.unwrap().is_none());

        // Zero visibility: the lock is already expired
        store.reschedule(job.id, "retry", Utc::now()).await.unwrap();
        let again = store.claim_next(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        let redelivered = store.claim_next(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(redelivered.attempts, 3);

        store.complete(job.id).await.unwrap();
        assert_eq!(store.stats().await.unwrap().completed, 1);
        assert_eq!(
            store
                .purge_completed(Utc::now() + chrono::Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
    }
}
