//! Opening balance and budget seeding
//!
//! Bulk, validated records describing where an entity starts and what it
//! plans to spend. Neither touches account balances: opening balances are
//! descriptive records, not postings.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::amount::non_negative;
use crate::domain::{DomainError, OperationContext};
use crate::error::AppResult;
use crate::store::{ChartStore, SeedStore, Store};

/// Lifecycle of a seeding record; finalizing is one-way
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedStatus {
    Draft,
    Finalized,
}

impl SeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedStatus::Draft => "draft",
            SeedStatus::Finalized => "finalized",
        }
    }
}

impl fmt::Display for SeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeedStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(SeedStatus::Draft),
            "finalized" => Ok(SeedStatus::Finalized),
            other => Err(DomainError::not_found(format!("seed status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningBalanceLine {
    pub account_id: Uuid,
    #[serde(default)]
    pub debit: Decimal,
    #[serde(default)]
    pub credit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningBalance {
    pub id: Uuid,
    pub group_id: Uuid,
    pub entity_id: Uuid,
    pub date: NaiveDate,
    pub lines: Vec<OpeningBalanceLine>,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
    /// total_credit - total_debit
    pub difference: Decimal,
    pub status: SeedStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl OpeningBalance {
    fn set_lines(&mut self, lines: Vec<OpeningBalanceLine>) {
        self.total_debit = lines.iter().map(|l| l.debit).sum();
        self.total_credit = lines.iter().map(|l| l.credit).sum();
        self.difference = self.total_credit - self.total_debit;
        self.lines = lines;
    }

    pub fn is_balanced(&self) -> bool {
        self.difference.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLine {
    pub account_id: Uuid,
    /// 1..=12
    pub month: u32,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub group_id: Uuid,
    pub entity_id: Uuid,
    pub name: String,
    pub fiscal_year: i32,
    pub lines: Vec<BudgetLine>,
    pub total: Decimal,
    pub status: SeedStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Budget {
    fn set_lines(&mut self, lines: Vec<BudgetLine>) {
        self.total = lines.iter().map(|l| l.amount).sum();
        self.lines = lines;
    }
}

fn validate_opening_lines(lines: &[OpeningBalanceLine]) -> Result<(), DomainError> {
    if lines.is_empty() {
        return Err(DomainError::InsufficientLines(0));
    }
    for line in lines {
        non_negative(line.debit)?;
        non_negative(line.credit)?;
    }
    Ok(())
}

fn validate_budget_lines(lines: &[BudgetLine]) -> Result<(), DomainError> {
    if lines.is_empty() {
        return Err(DomainError::InsufficientLines(0));
    }
    let mut seen = HashSet::with_capacity(lines.len());
    for line in lines {
        if !(1..=12).contains(&line.month) {
            return Err(DomainError::BusinessRuleViolation(format!(
                "budget month {} is outside 1..=12",
                line.month
            )));
        }
        if !seen.insert((line.account_id, line.month)) {
            return Err(DomainError::conflict(format!(
                "account {} is budgeted twice for month {}",
                line.account_id, line.month
            )));
        }
        non_negative(line.amount)?;
    }
    Ok(())
}

/// Service for opening balances and budgets
#[derive(Clone)]
pub struct SeedingService {
    store: Arc<dyn Store>,
}

impl SeedingService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Every account must belong to the requesting entity; the first
    /// offender is reported.
    async fn ensure_entity_accounts(
        &self,
        ctx: &OperationContext,
        account_ids: impl Iterator<Item = Uuid>,
    ) -> AppResult<()> {
        for account_id in account_ids {
            match self.store.get_account(account_id).await? {
                Some(account)
                    if account.entity_id == ctx.entity_id && account.group_id == ctx.group_id => {}
                _ => return Err(DomainError::AccountNotInEntity(account_id).into()),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Opening balance
    // =========================================================================

    pub async fn create_opening_balance(
        &self,
        ctx: &OperationContext,
        date: NaiveDate,
        lines: Vec<OpeningBalanceLine>,
    ) -> AppResult<OpeningBalance> {
        validate_opening_lines(&lines)?;
        self.ensure_entity_accounts(ctx, lines.iter().map(|l| l.account_id))
            .await?;

        let now = Utc::now();
        let mut record = OpeningBalance {
            id: Uuid::new_v4(),
            group_id: ctx.group_id,
            entity_id: ctx.entity_id,
            date,
            lines: Vec::new(),
            total_debit: Decimal::ZERO,
            total_credit: Decimal::ZERO,
            difference: Decimal::ZERO,
            status: SeedStatus::Draft,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        };
        record.set_lines(lines);

        self.store.insert_opening_balance(&record).await?;

        tracing::info!(
            opening_balance_id = %record.id,
            entity_id = %record.entity_id,
            difference = %record.difference,
            "Opening balance created"
        );
        Ok(record)
    }

    pub async fn get_opening_balance(
        &self,
        ctx: &OperationContext,
        id: Uuid,
    ) -> AppResult<OpeningBalance> {
        match self.store.get_opening_balance(id).await? {
            Some(record) if record.entity_id == ctx.entity_id => Ok(record),
            _ => Err(DomainError::not_found(format!("opening balance {}", id)).into()),
        }
    }

    pub async fn update_opening_balance(
        &self,
        ctx: &OperationContext,
        id: Uuid,
        date: NaiveDate,
        lines: Vec<OpeningBalanceLine>,
    ) -> AppResult<OpeningBalance> {
        let mut record = self.get_opening_balance(ctx, id).await?;
        if record.status == SeedStatus::Finalized {
            return Err(DomainError::FinalizedRecord(id).into());
        }

        validate_opening_lines(&lines)?;
        self.ensure_entity_accounts(ctx, lines.iter().map(|l| l.account_id))
            .await?;

        record.date = date;
        record.set_lines(lines);
        record.updated_at = Utc::now();

        // Finalized concurrently
        if !self.store.update_opening_balance(&record).await? {
            return Err(DomainError::FinalizedRecord(id).into());
        }
        Ok(record)
    }

    pub async fn finalize_opening_balance(
        &self,
        ctx: &OperationContext,
        id: Uuid,
    ) -> AppResult<OpeningBalance> {
        let mut record = self.get_opening_balance(ctx, id).await?;
        if record.status == SeedStatus::Finalized {
            return Err(DomainError::FinalizedRecord(id).into());
        }

        let now = Utc::now();
        record.status = SeedStatus::Finalized;
        record.finalized_at = Some(now);
        record.updated_at = now;

        if !self.store.update_opening_balance(&record).await? {
            return Err(DomainError::FinalizedRecord(id).into());
        }

        tracing::info!(
            opening_balance_id = %id,
            actor_id = ?ctx.actor_id,
            "Opening balance finalized"
        );
        Ok(record)
    }

    pub async fn delete_opening_balance(&self, ctx: &OperationContext, id: Uuid) -> AppResult<()> {
        let record = self.get_opening_balance(ctx, id).await?;
        if record.status == SeedStatus::Finalized || !self.store.delete_opening_balance(id).await? {
            return Err(DomainError::FinalizedRecord(id).into());
        }
        Ok(())
    }

    // =========================================================================
    // Budgets
    // =========================================================================

    pub async fn create_budget(
        &self,
        ctx: &OperationContext,
        name: &str,
        fiscal_year: i32,
        lines: Vec<BudgetLine>,
    ) -> AppResult<Budget> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DomainError::BusinessRuleViolation("budget name is empty".into()).into());
        }
        validate_budget_lines(&lines)?;
        self.ensure_entity_accounts(ctx, lines.iter().map(|l| l.account_id))
            .await?;

        let now = Utc::now();
        let mut budget = Budget {
            id: Uuid::new_v4(),
            group_id: ctx.group_id,
            entity_id: ctx.entity_id,
            name: name.to_string(),
            fiscal_year,
            lines: Vec::new(),
            total: Decimal::ZERO,
            status: SeedStatus::Draft,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        };
        budget.set_lines(lines);

        self.store.insert_budget(&budget).await?;

        tracing::info!(
            budget_id = %budget.id,
            entity_id = %budget.entity_id,
            fiscal_year,
            "Budget created"
        );
        Ok(budget)
    }

    pub async fn get_budget(&self, ctx: &OperationContext, id: Uuid) -> AppResult<Budget> {
        match self.store.get_budget(id).await? {
            Some(budget) if budget.entity_id == ctx.entity_id => Ok(budget),
            _ => Err(DomainError::not_found(format!("budget {}", id)).into()),
        }
    }

    pub async fn update_budget(
        &self,
        ctx: &OperationContext,
        id: Uuid,
        lines: Vec<BudgetLine>,
    ) -> AppResult<Budget> {
        let mut budget = self.get_budget(ctx, id).await?;
        if budget.status == SeedStatus::Finalized {
            return Err(DomainError::FinalizedRecord(id).into());
        }

        validate_budget_lines(&lines)?;
        self.ensure_entity_accounts(ctx, lines.iter().map(|l| l.account_id))
            .await?;

        budget.set_lines(lines);
        budget.updated_at = Utc::now();

        if !self.store.update_budget(&budget).await? {
            return Err(DomainError::FinalizedRecord(id).into());
        }
        Ok(budget)
    }

    pub async fn finalize_budget(&self, ctx: &OperationContext, id: Uuid) -> AppResult<Budget> {
        let mut budget = self.get_budget(ctx, id).await?;
        if budget.status == SeedStatus::Finalized {
            return Err(DomainError::FinalizedRecord(id).into());
        }

        let now = Utc::now();
        budget.status = SeedStatus::Finalized;
        budget.finalized_at = Some(now);
        budget.updated_at = now;

        if !self.store.update_budget(&budget).await? {
            return Err(DomainError::FinalizedRecord(id).into());
        }
        Ok(budget)
    }

    pub async fn delete_budget(&self, ctx: &OperationContext, id: Uuid) -> AppResult<()> {
        let budget = self.get_budget(ctx, id).await?;
        if budget.status == SeedStatus::Finalized || !self.store.delete_budget(id).await? {
            return Err(DomainError::FinalizedRecord(id).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Account, AccountSubCategory, AccountType};
    use crate::error::AppError;
    use crate::store::{ChartStore, InMemoryStore};
    use rust_decimal_macros::dec;

    struct Fixture {
        service: SeedingService,
        ctx: OperationContext,
        cash: Uuid,
        equity: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let ctx = OperationContext::new(Uuid::new_v4(), Uuid::new_v4());

        let mut ids = Vec::new();
        for (account_type, code) in [(AccountType::Assets, "1110-01"), (AccountType::Equity, "3110-01")] {
            let sub = AccountSubCategory {
                id: Uuid::new_v4(),
                group_id: ctx.group_id,
                category_id: Uuid::new_v4(),
                account_type,
                code: 1110,
                name: "sub".into(),
                created_at: Utc::now(),
            };
            let account = Account::open(ctx.entity_id, &sub, code.into(), code.into());
            store.insert_account(&account).await.unwrap();
            ids.push(account.id);
        }

        Fixture {
            service: SeedingService::new(store),
            ctx,
            cash: ids[0],
            equity: ids[1],
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
    }

    #[tokio::test]
    async fn test_opening_balance_totals_and_difference() {
        let f = fixture().await;
        let record = f
            .service
            .create_opening_balance(
                &f.ctx,
                date(),
                vec![
                    OpeningBalanceLine {
                        account_id: f.cash,
                        debit: dec!(5000),
                        credit: dec!(0),
                    },
                    OpeningBalanceLine {
                        account_id: f.equity,
                        debit: dec!(0),
                        credit: dec!(4500),
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(record.total_debit, dec!(5000));
        assert_eq!(record.total_credit, dec!(4500));
        assert_eq!(record.difference, dec!(-500));
        assert_eq!(record.status, SeedStatus::Draft);
        assert!(!record.is_balanced());
    }

    #[tokio::test]
    async fn test_opening_balance_rejects_foreign_account() {
        let f = fixture().await;
        let foreign = Uuid::new_v4();
        let err = f
            .service
            .create_opening_balance(
                &f.ctx,
                date(),
                vec![
                    OpeningBalanceLine {
                        account_id: f.cash,
                        debit: dec!(10),
                        credit: dec!(0),
                    },
                    OpeningBalanceLine {
                        account_id: foreign,
                        debit: dec!(0),
                        credit: dec!(10),
                    },
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Domain(DomainError::AccountNotInEntity(id)) if id == foreign
        ));
    }

    #[tokio::test]
    async fn test_finalized_opening_balance_is_frozen() {
        let f = fixture().await;
        let lines = vec![
            OpeningBalanceLine {
                account_id: f.cash,
                debit: dec!(100),
                credit: dec!(0),
            },
            OpeningBalanceLine {
                account_id: f.equity,
                debit: dec!(0),
                credit: dec!(100),
            },
        ];
        let record = f
            .service
            .create_opening_balance(&f.ctx, date(), lines.clone())
            .await
            .unwrap();

        let finalized = f
            .service
            .finalize_opening_balance(&f.ctx, record.id)
            .await
            .unwrap();
        assert_eq!(finalized.status, SeedStatus::Finalized);
        assert!(finalized.finalized_at.is_some());

        let update = f
            .service
            .update_opening_balance(&f.ctx, record.id, date(), lines)
            .await;
        assert!(matches!(
            update,
            Err(AppError::Domain(DomainError::FinalizedRecord(_)))
        ));

        let delete = f.service.delete_opening_balance(&f.ctx, record.id).await;
        assert!(matches!(
            delete,
            Err(AppError::Domain(DomainError::FinalizedRecord(_)))
        ));

        let again = f.service.finalize_opening_balance(&f.ctx, record.id).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_draft_opening_balance_update_and_delete() {
        let f = fixture().await;
        let record = f
            .service
            .create_opening_balance(
                &f.ctx,
                date(),
                vec![OpeningBalanceLine {
                    account_id: f.cash,
                    debit: dec!(1),
                    credit: dec!(0),
                }],
            )
            .await
            .unwrap();

        let updated = f
            .service
            .update_opening_balance(
                &f.ctx,
                record.id,
                date(),
                vec![
                    OpeningBalanceLine {
                        account_id: f.cash,
                        debit: dec!(250),
                        credit: dec!(0),
                    },
                    OpeningBalanceLine {
                        account_id: f.equity,
                        debit: dec!(0),
                        credit: dec!(250),
                    },
                ],
            )
            .await
            .unwrap();
        assert!(updated.is_balanced());

        f.service
            .delete_opening_balance(&f.ctx, record.id)
            .await
            .unwrap();
        assert!(f
            .service
            .get_opening_balance(&f.ctx, record.id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_budget_lifecycle() {
        let f = fixture().await;
        let budget = f
            .service
            .create_budget(
                &f.ctx,
                "Operating 2026",
                2026,
                vec![
                    BudgetLine {
                        account_id: f.cash,
                        month: 1,
                        amount: dec!(1200),
                    },
                    BudgetLine {
                        account_id: f.cash,
                        month: 2,
                        amount: dec!(800),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(budget.total, dec!(2000));

        let finalized = f.service.finalize_budget(&f.ctx, budget.id).await.unwrap();
        assert_eq!(finalized.status, SeedStatus::Finalized);

        let update = f.service.update_budget(&f.ctx, budget.id, vec![]).await;
        assert!(matches!(
            update,
            Err(AppError::Domain(DomainError::FinalizedRecord(_)))
        ));
    }

    #[tokio::test]
    async fn test_budget_line_validation() {
        let f = fixture().await;
        let bad_month = f
            .service
            .create_budget(
                &f.ctx,
                "FY",
                2026,
                vec![BudgetLine {
                    account_id: f.cash,
                    month: 13,
                    amount: dec!(1),
                }],
            )
            .await;
        assert!(bad_month.is_err());

        let duplicate = f
            .service
            .create_budget(
                &f.ctx,
                "FY",
                2026,
                vec![
                    BudgetLine {
                        account_id: f.cash,
                        month: 3,
                        amount: dec!(1),
                    },
                    BudgetLine {
                        account_id: f.cash,
                        month: 3,
                        amount: dec!(2),
                    },
                ],
            )
            .await;
        assert!(matches!(
            duplicate,
            Err(AppError::Domain(DomainError::Conflict(_)))
        ));
    }
}
