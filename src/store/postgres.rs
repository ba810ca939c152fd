//! PostgreSQL store
//!
//! sqlx implementation of the store traits. Posting commits run as
//! SERIALIZABLE transactions and are retried on serialization failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    Account, AccountCategory, AccountSubCategory, AccountTransaction, ChartRoleBindings,
    DocumentRecord, DocumentRef, DomainError, Journal, PostingStatus,
};
use crate::pipeline::job::{chrono_duration, JobStats, JobStatus, PostingJob};
use crate::posting::check_settlement;
use crate::seeding::{Budget, OpeningBalance, SeedStatus};

use super::{
    ChartStore, DocumentStore, DocumentSubmission, JobQueue, LedgerStore, PostingCommit,
    SeedStore, StoreError,
};

/// Postgres-backed store
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =========================================================================
// Row mapping
// =========================================================================

fn parse<T: FromStr<Err = DomainError>>(raw: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|e: DomainError| StoreError::Corrupt(e.to_string()))
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} = {}", column, value)))
}

fn to_i32(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} does not fit INTEGER", value)))
}

/// Map unique violations to a domain conflict
fn conflict_on_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return DomainError::conflict(what()).into();
        }
    }
    err.into()
}

/// SQLSTATE 40001 / 40P01
fn is_serialization_failure(err: &StoreError) -> bool {
    match err {
        StoreError::Database(sqlx::Error::Database(db_err)) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

fn category_from_row(row: &PgRow) -> Result<AccountCategory, StoreError> {
    Ok(AccountCategory {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        account_type: parse(row.try_get::<&str, _>("account_type")?)?,
        code: to_u32(row.try_get("code")?, "code")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn sub_category_from_row(row: &PgRow) -> Result<AccountSubCategory, StoreError> {
    Ok(AccountSubCategory {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        category_id: row.try_get("category_id")?,
        account_type: parse(row.try_get::<&str, _>("account_type")?)?,
        code: to_u32(row.try_get("code")?, "code")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    Ok(Account {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        entity_id: row.try_get("entity_id")?,
        sub_category_id: row.try_get("sub_category_id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        account_type: parse(row.try_get::<&str, _>("account_type")?)?,
        normal_balance: parse(row.try_get::<&str, _>("normal_balance")?)?,
        balance: row.try_get("balance")?,
        is_bank_account: row.try_get("is_bank_account")?,
        created_at: row.try_get("created_at")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<DocumentRecord, StoreError> {
    Ok(DocumentRecord {
        reference: DocumentRef::new(parse(row.try_get::<&str, _>("kind")?)?, row.try_get("id")?),
        entity_id: row.try_get("entity_id")?,
        total: row.try_get("total")?,
        amount_settled: row.try_get("amount_settled")?,
        posting_status: parse(row.try_get::<&str, _>("posting_status")?)?,
        journal_id: row.try_get("journal_id")?,
        journal_reference: row.try_get("journal_reference")?,
        posted_at: row.try_get("posted_at")?,
        error_message: row.try_get("error_message")?,
        error_code: row.try_get("error_code")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn journal_from_row(row: &PgRow) -> Result<Journal, StoreError> {
    let Json(lines) = row.try_get("lines")?;
    Ok(Journal {
        id: row.try_get("id")?,
        entity_id: row.try_get("entity_id")?,
        reference: row.try_get("reference")?,
        date: row.try_get("date")?,
        description: row.try_get("description")?,
        source: DocumentRef::new(
            parse(row.try_get::<&str, _>("source_kind")?)?,
            row.try_get("source_id")?,
        ),
        lines,
        total_debit: row.try_get("total_debit")?,
        total_credit: row.try_get("total_credit")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<AccountTransaction, StoreError> {
    Ok(AccountTransaction {
        id: row.try_get("id")?,
        journal_id: row.try_get("journal_id")?,
        entity_id: row.try_get("entity_id")?,
        account_id: row.try_get("account_id")?,
        debit: row.try_get("debit")?,
        credit: row.try_get("credit")?,
        running_balance: row.try_get("running_balance")?,
        transaction_type: parse(row.try_get::<&str, _>("transaction_type")?)?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        related: DocumentRef::new(
            parse(row.try_get::<&str, _>("related_kind")?)?,
            row.try_get("related_id")?,
        ),
        created_at: row.try_get("created_at")?,
    })
}

fn opening_balance_from_row(row: &PgRow) -> Result<OpeningBalance, StoreError> {
    let Json(lines) = row.try_get("lines")?;
    Ok(OpeningBalance {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        entity_id: row.try_get("entity_id")?,
        date: row.try_get("date")?,
        lines,
        total_debit: row.try_get("total_debit")?,
        total_credit: row.try_get("total_credit")?,
        difference: row.try_get("difference")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finalized_at: row.try_get("finalized_at")?,
    })
}

fn budget_from_row(row: &PgRow) -> Result<Budget, StoreError> {
    let Json(lines) = row.try_get("lines")?;
    Ok(Budget {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        entity_id: row.try_get("entity_id")?,
        name: row.try_get("name")?,
        fiscal_year: row.try_get("fiscal_year")?,
        lines,
        total: row.try_get("total")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finalized_at: row.try_get("finalized_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<PostingJob, StoreError> {
    Ok(PostingJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        document: DocumentRef::new(
            parse(row.try_get::<&str, _>("document_kind")?)?,
            row.try_get("document_id")?,
        ),
        payload: row.try_get("payload")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        max_attempts: to_u32(row.try_get("max_attempts")?, "max_attempts")?,
        run_at: row.try_get("run_at")?,
        locked_until: row.try_get("locked_until")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_job<'e, E: PgExecutor<'e>>(executor: E, job: &PostingJob) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO posting_jobs (
            id, name, document_kind, document_id, payload, status,
            attempts, max_attempts, run_at, locked_until, last_error, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(job.id)
    .bind(&job.name)
    .bind(job.document.kind.as_str())
    .bind(job.document.id)
    .bind(&job.payload)
    .bind(job.status.as_str())
    .bind(to_i32(job.attempts)?)
    .bind(to_i32(job.max_attempts)?)
    .bind(job.run_at)
    .bind(job.locked_until)
    .bind(&job.last_error)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

// =========================================================================
// Chart
// =========================================================================

#[async_trait]
impl ChartStore for PgStore {
    async fn insert_category(&self, category: &AccountCategory) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO account_categories (id, group_id, account_type, code, name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(category.id)
        .bind(category.group_id)
        .bind(category.account_type.as_str())
        .bind(to_i32(category.code)?)
        .bind(&category.name)
        .bind(category.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("category code {} already exists in this group", category.code)
            })
        })?;
        Ok(())
    }

    async fn get_category(&self, id: Uuid) -> Result<Option<AccountCategory>, StoreError> {
        sqlx::query("SELECT * FROM account_categories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(category_from_row)
            .transpose()
    }

    async fn list_categories(&self, group_id: Uuid) -> Result<Vec<AccountCategory>, StoreError> {
        sqlx::query("SELECT * FROM account_categories WHERE group_id = $1 ORDER BY code")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(category_from_row)
            .collect()
    }

    async fn insert_sub_category(
        &self,
        sub_category: &AccountSubCategory,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO account_sub_categories (
                id, group_id, category_id, account_type, code, name, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(sub_category.id)
        .bind(sub_category.group_id)
        .bind(sub_category.category_id)
        .bind(sub_category.account_type.as_str())
        .bind(to_i32(sub_category.code)?)
        .bind(&sub_category.name)
        .bind(sub_category.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!(
                    "sub-category code {} already exists in this category",
                    sub_category.code
                )
            })
        })?;
        Ok(())
    }

    async fn get_sub_category(&self, id: Uuid) -> Result<Option<AccountSubCategory>, StoreError> {
        sqlx::query("SELECT * FROM account_sub_categories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(sub_category_from_row)
            .transpose()
    }

    async fn find_sub_category_by_code(
        &self,
        group_id: Uuid,
        code: u32,
    ) -> Result<Option<AccountSubCategory>, StoreError> {
        sqlx::query("SELECT * FROM account_sub_categories WHERE group_id = $1 AND code = $2")
            .bind(group_id)
            .bind(to_i32(code)?)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(sub_category_from_row)
            .transpose()
    }

    async fn list_sub_categories(
        &self,
        category_id: Uuid,
    ) -> Result<Vec<AccountSubCategory>, StoreError> {
        sqlx::query("SELECT * FROM account_sub_categories WHERE category_id = $1 ORDER BY code")
            .bind(category_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(sub_category_from_row)
            .collect()
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, group_id, entity_id, sub_category_id, code, name,
                account_type, normal_balance, balance, is_bank_account, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(account.id)
        .bind(account.group_id)
        .bind(account.entity_id)
        .bind(account.sub_category_id)
        .bind(&account.code)
        .bind(&account.name)
        .bind(account.account_type.as_str())
        .bind(account.normal_balance.as_str())
        .bind(account.balance)
        .bind(account.is_bank_account)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("account code {} already exists in this entity", account.code)
            })
        })?;
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        sqlx::query("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(account_from_row)
            .transpose()
    }

    async fn find_account_by_code(
        &self,
        entity_id: Uuid,
        code: &str,
    ) -> Result<Option<Account>, StoreError> {
        sqlx::query("SELECT * FROM accounts WHERE entity_id = $1 AND code = $2")
            .bind(entity_id)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(account_from_row)
            .transpose()
    }

    async fn list_accounts(&self, entity_id: Uuid) -> Result<Vec<Account>, StoreError> {
        sqlx::query("SELECT * FROM accounts WHERE entity_id = $1 ORDER BY code")
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(account_from_row)
            .collect()
    }

    async fn save_bindings(&self, bindings: &ChartRoleBindings) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM role_bindings WHERE entity_id = $1")
            .bind(bindings.entity_id)
            .execute(&mut *tx)
            .await?;

        for (role, bound) in bindings.iter() {
            sqlx::query(
                "INSERT INTO role_bindings (entity_id, role, account_id) VALUES ($1, $2, $3)",
            )
            .bind(bindings.entity_id)
            .bind(role.as_str())
            .bind(bound.account_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_bindings(&self, entity_id: Uuid) -> Result<ChartRoleBindings, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT rb.role, a.*
            FROM role_bindings rb
            JOIN accounts a ON a.id = rb.account_id
            WHERE rb.entity_id = $1
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        let mut bindings = ChartRoleBindings::new(entity_id);
        for row in &rows {
            let role = parse(row.try_get::<&str, _>("role")?)?;
            bindings.bind(role, &account_from_row(row)?)?;
        }
        Ok(bindings)
    }
}

// =========================================================================
// Documents
// =========================================================================

impl PgStore {
    async fn try_submit(&self, submission: &DocumentSubmission) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let record = &submission.record;

        if let Some((target, amount)) = submission.settles {
            // Guarded increment; the row lock serialises concurrent payments
            let applied: Option<Decimal> = sqlx::query_scalar(
                r#"
                UPDATE posting_documents
                SET amount_settled = amount_settled + $3, updated_at = NOW()
                WHERE kind = $1 AND id = $2 AND entity_id = $4
                  AND amount_settled + $3 <= total
                RETURNING amount_settled
                "#,
            )
            .bind(target.kind.as_str())
            .bind(target.id)
            .bind(amount)
            .bind(record.entity_id)
            .fetch_optional(&mut *tx)
            .await?;

            if applied.is_none() {
                let row = sqlx::query(
                    "SELECT * FROM posting_documents WHERE kind = $1 AND id = $2",
                )
                .bind(target.kind.as_str())
                .bind(target.id)
                .fetch_optional(&mut *tx)
                .await?;

                let Some(row) = row else {
                    return Err(DomainError::not_found(format!("document {}", target)).into());
                };
                let paid = document_from_row(&row)?;
                if paid.entity_id != record.entity_id {
                    return Err(DomainError::BusinessRuleViolation(format!(
                        "{} belongs to another entity",
                        target
                    ))
                    .into());
                }
                check_settlement(paid.total, paid.amount_settled, amount)?;
                // Passed on re-read: the total changed under us
                return Err(StoreError::Unavailable(format!(
                    "settlement of {} raced with another writer",
                    target
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO posting_documents (
                kind, id, entity_id, total, amount_settled, posting_status,
                attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.reference.kind.as_str())
        .bind(record.reference.id)
        .bind(record.entity_id)
        .bind(record.total)
        .bind(record.amount_settled)
        .bind(record.posting_status.as_str())
        .bind(record.attempts)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || format!("document {} already submitted", record.reference))
        })?;

        insert_job(&mut *tx, &submission.job).await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn submit_document(&self, submission: DocumentSubmission) -> Result<(), StoreError> {
        self.try_submit(&submission).await
    }

    async fn get_document(
        &self,
        document: DocumentRef,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        sqlx::query("SELECT * FROM posting_documents WHERE kind = $1 AND id = $2")
            .bind(document.kind.as_str())
            .bind(document.id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document_from_row)
            .transpose()
    }

    async fn transition_status(
        &self,
        document: DocumentRef,
        from: PostingStatus,
        to: PostingStatus,
    ) -> Result<bool, StoreError> {
        from.transition(to)?;
        let result = sqlx::query(
            r#"
            UPDATE posting_documents
            SET posting_status = $4,
                attempts = attempts + CASE WHEN $4 = 'processing' THEN 1 ELSE 0 END,
                updated_at = NOW()
            WHERE kind = $1 AND id = $2 AND posting_status = $3
            "#,
        )
        .bind(document.kind.as_str())
        .bind(document.id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_document(document).await? {
            Some(_) => Ok(false),
            None => Err(DomainError::not_found(format!("document {}", document)).into()),
        }
    }

    async fn mark_failed(
        &self,
        document: DocumentRef,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE posting_documents
            SET posting_status = 'failed', error_code = $3, error_message = $4, updated_at = NOW()
            WHERE kind = $1 AND id = $2 AND posting_status = 'processing'
            "#,
        )
        .bind(document.kind.as_str())
        .bind(document.id)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_document(
        &self,
        document: DocumentRef,
        job: PostingJob,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE posting_documents
            SET posting_status = 'pending', updated_at = NOW()
            WHERE kind = $1 AND id = $2 AND posting_status = 'failed'
            "#,
        )
        .bind(document.kind.as_str())
        .bind(document.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(false);
        }

        insert_job(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_stale_processing(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        sqlx::query(
            r#"
            SELECT * FROM posting_documents
            WHERE posting_status = 'processing' AND updated_at < $1
            ORDER BY updated_at
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(document_from_row)
        .collect()
    }

    async fn list_retryable_failed(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        sqlx::query(
            r#"
            SELECT * FROM posting_documents
            WHERE posting_status = 'failed' AND attempts < $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(to_i32(max_attempts)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(document_from_row)
        .collect()
    }
}

// =========================================================================
// Ledger
// =========================================================================

impl PgStore {
    /// Single attempt of a posting commit
    async fn try_commit_posting(
        &self,
        commit: &PostingCommit,
    ) -> Result<Vec<AccountTransaction>, StoreError> {
        let journal = &commit.journal;
        let source = journal.source;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        // Re-check under lock that this worker still owns the document
        let status: Option<String> = sqlx::query_scalar(
            "SELECT posting_status FROM posting_documents WHERE kind = $1 AND id = $2 FOR UPDATE",
        )
        .bind(source.kind.as_str())
        .bind(source.id)
        .fetch_optional(&mut *tx)
        .await?;

        let status: PostingStatus = match status {
            Some(raw) => parse(&raw)?,
            None => return Err(DomainError::not_found(format!("document {}", source)).into()),
        };
        if status != PostingStatus::Processing {
            return Err(DomainError::InvalidStatusTransition {
                from: status,
                to: PostingStatus::Success,
            }
            .into());
        }

        sqlx::query(
            r#"
            INSERT INTO journals (
                id, entity_id, reference, date, description, source_kind, source_id,
                lines, total_debit, total_credit, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(journal.id)
        .bind(journal.entity_id)
        .bind(&journal.reference)
        .bind(journal.date)
        .bind(&journal.description)
        .bind(source.kind.as_str())
        .bind(source.id)
        .bind(Json(&journal.lines))
        .bind(journal.total_debit)
        .bind(journal.total_credit)
        .bind(journal.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("{} is already posted", source)))?;

        // Increment in account id order so concurrent postings lock rows
        // in the same order
        let mut ordered: Vec<_> = journal.lines.iter().collect();
        ordered.sort_by_key(|line| line.account_id());

        let mut balances = BTreeMap::new();
        for line in ordered {
            let balance = self
                .increment_balance(
                    &mut tx,
                    journal.entity_id,
                    line.account_id(),
                    line.debit_amount(),
                    line.credit_amount(),
                )
                .await?;
            balances.insert(line.account_id(), balance);
        }

        let mut rows = Vec::with_capacity(journal.lines.len());
        for line in &journal.lines {
            let running_balance = balances.get(&line.account_id()).copied().ok_or_else(|| {
                StoreError::Corrupt(format!("no balance for account {}", line.account_id()))
            })?;
            let row = AccountTransaction {
                id: Uuid::new_v4(),
                journal_id: journal.id,
                entity_id: journal.entity_id,
                account_id: line.account_id(),
                debit: line.debit_amount(),
                credit: line.credit_amount(),
                running_balance,
                transaction_type: commit.transaction_type,
                status: PostingStatus::Success,
                related: source,
                created_at: journal.created_at,
            };

            sqlx::query(
                r#"
                INSERT INTO account_transactions (
                    id, journal_id, entity_id, account_id, debit, credit, running_balance,
                    transaction_type, status, related_kind, related_id, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(row.id)
            .bind(row.journal_id)
            .bind(row.entity_id)
            .bind(row.account_id)
            .bind(row.debit)
            .bind(row.credit)
            .bind(row.running_balance)
            .bind(row.transaction_type.as_str())
            .bind(row.status.as_str())
            .bind(row.related.kind.as_str())
            .bind(row.related.id)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;

            rows.push(row);
        }

        sqlx::query(
            r#"
            UPDATE posting_documents
            SET posting_status = 'success',
                journal_id = $3,
                journal_reference = $4,
                posted_at = $5,
                error_code = NULL,
                error_message = NULL,
                updated_at = NOW()
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(source.kind.as_str())
        .bind(source.id)
        .bind(journal.id)
        .bind(&journal.reference)
        .bind(journal.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rows)
    }

    /// Atomic `balance = balance + delta` by the account's normal side
    async fn increment_balance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entity_id: Uuid,
        account_id: Uuid,
        debit: Decimal,
        credit: Decimal,
    ) -> Result<Decimal, StoreError> {
        let balance: Option<Decimal> = sqlx::query_scalar(
            r#"
            UPDATE accounts
            SET balance = balance + CASE WHEN normal_balance = 'debit' THEN $3 - $4 ELSE $4 - $3 END
            WHERE id = $1 AND entity_id = $2
            RETURNING balance
            "#,
        )
        .bind(account_id)
        .bind(entity_id)
        .bind(debit)
        .bind(credit)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(balance) = balance {
            return Ok(balance);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM accounts WHERE id = $1)")
            .bind(account_id)
            .fetch_one(&mut **tx)
            .await?;
        if exists {
            Err(DomainError::AccountNotInEntity(account_id).into())
        } else {
            Err(DomainError::not_found(format!("account {}", account_id)).into())
        }
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn commit_posting(
        &self,
        commit: PostingCommit,
    ) -> Result<Vec<AccountTransaction>, StoreError> {
        const MAX_RETRIES: u32 = 3;

        let mut attempt = 0;
        loop {
            match self.try_commit_posting(&commit).await {
                Err(err) if is_serialization_failure(&err) && attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        journal_id = %commit.journal.id,
                        "Serialization failure, retrying commit (attempt {}/{})",
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                result => return result,
            }
        }
    }

    async fn get_journal(&self, id: Uuid) -> Result<Option<Journal>, StoreError> {
        sqlx::query("SELECT * FROM journals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(journal_from_row)
            .transpose()
    }

    async fn find_journal_by_source(
        &self,
        source: DocumentRef,
    ) -> Result<Option<Journal>, StoreError> {
        sqlx::query("SELECT * FROM journals WHERE source_kind = $1 AND source_id = $2")
            .bind(source.kind.as_str())
            .bind(source.id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(journal_from_row)
            .transpose()
    }

    async fn list_account_transactions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<AccountTransaction>, StoreError> {
        sqlx::query("SELECT * FROM account_transactions WHERE account_id = $1 ORDER BY seq")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(transaction_from_row)
            .collect()
    }

    async fn count_journals(&self, entity_id: Uuid) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM journals WHERE entity_id = $1")
            .bind(entity_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

// =========================================================================
// Seeding
// =========================================================================

#[async_trait]
impl SeedStore for PgStore {
    async fn insert_opening_balance(&self, record: &OpeningBalance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO opening_balances (
                id, group_id, entity_id, date, lines, total_debit, total_credit,
                difference, status, created_at, updated_at, finalized_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(record.group_id)
        .bind(record.entity_id)
        .bind(record.date)
        .bind(Json(&record.lines))
        .bind(record.total_debit)
        .bind(record.total_credit)
        .bind(record.difference)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.finalized_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("entity {} already has an opening balance", record.entity_id)
            })
        })?;
        Ok(())
    }

    async fn get_opening_balance(&self, id: Uuid) -> Result<Option<OpeningBalance>, StoreError> {
        sqlx::query("SELECT * FROM opening_balances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(opening_balance_from_row)
            .transpose()
    }

    async fn update_opening_balance(&self, record: &OpeningBalance) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE opening_balances
            SET date = $2, lines = $3, total_debit = $4, total_credit = $5, difference = $6,
                status = $7, updated_at = $8, finalized_at = $9
            WHERE id = $1 AND status = $10
            "#,
        )
        .bind(record.id)
        .bind(record.date)
        .bind(Json(&record.lines))
        .bind(record.total_debit)
        .bind(record.total_credit)
        .bind(record.difference)
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .bind(record.finalized_at)
        .bind(SeedStatus::Draft.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_opening_balance(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM opening_balances WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(SeedStatus::Draft.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_budget(&self, budget: &Budget) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO budgets (
                id, group_id, entity_id, name, fiscal_year, lines, total,
                status, created_at, updated_at, finalized_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(budget.id)
        .bind(budget.group_id)
        .bind(budget.entity_id)
        .bind(&budget.name)
        .bind(budget.fiscal_year)
        .bind(Json(&budget.lines))
        .bind(budget.total)
        .bind(budget.status.as_str())
        .bind(budget.created_at)
        .bind(budget.updated_at)
        .bind(budget.finalized_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!(
                    "budget '{}' for {} already exists",
                    budget.name, budget.fiscal_year
                )
            })
        })?;
        Ok(())
    }

    async fn get_budget(&self, id: Uuid) -> Result<Option<Budget>, StoreError> {
        sqlx::query("SELECT * FROM budgets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(budget_from_row)
            .transpose()
    }

    async fn update_budget(&self, budget: &Budget) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE budgets
            SET lines = $2, total = $3, status = $4, updated_at = $5, finalized_at = $6
            WHERE id = $1 AND status = $7
            "#,
        )
        .bind(budget.id)
        .bind(Json(&budget.lines))
        .bind(budget.total)
        .bind(budget.status.as_str())
        .bind(budget.updated_at)
        .bind(budget.finalized_at)
        .bind(SeedStatus::Draft.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_budget(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM budgets WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(SeedStatus::Draft.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

// =========================================================================
// Job queue
// =========================================================================

#[async_trait]
impl JobQueue for PgStore {
    async fn enqueue(&self, job: &PostingJob) -> Result<(), StoreError> {
        insert_job(&self.pool, job).await
    }

    async fn claim_next(&self, visibility: Duration) -> Result<Option<PostingJob>, StoreError> {
        let now = Utc::now();
        let locked_until = now + chrono_duration(visibility);

        sqlx::query(
            r#"
            UPDATE posting_jobs
            SET status = 'running', attempts = attempts + 1, locked_until = $2, updated_at = $1
            WHERE id = (
                SELECT id FROM posting_jobs
                WHERE (status = 'queued' AND run_at <= $1)
                   OR (status = 'running' AND locked_until <= $1)
                ORDER BY run_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(locked_until)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(job_from_row)
        .transpose()
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE posting_jobs
            SET status = 'completed', locked_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        job_id: Uuid,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE posting_jobs
            SET status = 'queued', run_at = $2, last_error = $3, locked_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str, exhausted: bool) -> Result<(), StoreError> {
        let status = if exhausted {
            JobStatus::Dead
        } else {
            JobStatus::Failed
        };
        sqlx::query(
            r#"
            UPDATE posting_jobs
            SET status = $2, last_error = $3, locked_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<PostingJob>, StoreError> {
        sqlx::query("SELECT * FROM posting_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(job_from_row)
            .transpose()
    }

    async fn latest_job_for(
        &self,
        document: DocumentRef,
    ) -> Result<Option<PostingJob>, StoreError> {
        sqlx::query(
            r#"
            SELECT * FROM posting_jobs
            WHERE document_kind = $1 AND document_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(document.kind.as_str())
        .bind(document.id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(job_from_row)
        .transpose()
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM posting_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            stats.record(parse(&status)?, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM posting_jobs WHERE status = 'completed' AND updated_at < $1")
                .bind(before)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
