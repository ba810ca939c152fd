//! Ledger queries
//!
//! Read side over posted journals: balances, statements, the trial balance
//! and a recomputation check of stored balances.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    Account, AccountTransaction, AccountType, DomainError, Journal, NormalBalance,
    OperationContext,
};
use crate::error::AppResult;
use crate::store::Store;

/// Current balance of one account
#[derive(Debug, Clone, Serialize)]
pub struct AccountBalance {
    pub account_id: Uuid,
    pub code: String,
    pub name: String,
    pub normal_balance: NormalBalance,
    pub balance: Decimal,
}

/// Account transactions in posting order
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatement {
    pub account: Account,
    pub transactions: Vec<AccountTransaction>,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
}

/// One trial balance row; a balance sits in the column of its sign
#[derive(Debug, Clone, Serialize)]
pub struct TrialBalanceRow {
    pub account_id: Uuid,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub debit: Decimal,
    pub credit: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialBalance {
    pub entity_id: Uuid,
    pub rows: Vec<TrialBalanceRow>,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
    pub generated_at: DateTime<Utc>,
}

impl TrialBalance {
    pub fn is_balanced(&self) -> bool {
        self.total_debit == self.total_credit
    }
}

/// Stored balance against the sum of its transactions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceCheck {
    pub account_id: Uuid,
    pub stored: Decimal,
    pub recomputed: Decimal,
    /// Running balance of the latest transaction, if any
    pub last_running_balance: Option<Decimal>,
    pub consistent: bool,
}

#[derive(Clone)]
pub struct LedgerQueryService {
    store: Arc<dyn Store>,
}

impl LedgerQueryService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn entity_account(&self, ctx: &OperationContext, account_id: Uuid) -> AppResult<Account> {
        match self.store.get_account(account_id).await? {
            Some(account) if account.entity_id == ctx.entity_id => Ok(account),
            Some(_) => Err(DomainError::AccountNotInEntity(account_id).into()),
            None => Err(DomainError::not_found(format!("account {}", account_id)).into()),
        }
    }

    pub async fn account_balance(
        &self,
        ctx: &OperationContext,
        account_id: Uuid,
    ) -> AppResult<AccountBalance> {
        let account = self.entity_account(ctx, account_id).await?;
        Ok(AccountBalance {
            account_id: account.id,
            code: account.code,
            name: account.name,
            normal_balance: account.normal_balance,
            balance: account.balance,
        })
    }

    pub async fn account_statement(
        &self,
        ctx: &OperationContext,
        account_id: Uuid,
    ) -> AppResult<AccountStatement> {
        let account = self.entity_account(ctx, account_id).await?;
        let transactions = self.store.list_account_transactions(account_id).await?;

        let total_debit = transactions.iter().map(|t| t.debit).sum();
        let total_credit = transactions.iter().map(|t| t.credit).sum();
        Ok(AccountStatement {
            account,
            transactions,
            total_debit,
            total_credit,
        })
    }

    pub async fn journal(&self, ctx: &OperationContext, journal_id: Uuid) -> AppResult<Journal> {
        self.store
            .get_journal(journal_id)
            .await?
            .filter(|j| j.entity_id == ctx.entity_id)
            .ok_or_else(|| DomainError::not_found(format!("journal {}", journal_id)).into())
    }

    /// Debit and credit columns per account with a non-zero balance
    pub async fn trial_balance(&self, entity_id: Uuid) -> AppResult<TrialBalance> {
        let accounts = self.store.list_accounts(entity_id).await?;

        let mut rows = Vec::new();
        let mut total_debit = Decimal::ZERO;
        let mut total_credit = Decimal::ZERO;

        for account in accounts {
            if account.balance.is_zero() {
                continue;
            }
            // Positive balance sits on the normal side
            let on_debit_side = match account.normal_balance {
                NormalBalance::Debit => account.balance > Decimal::ZERO,
                NormalBalance::Credit => account.balance < Decimal::ZERO,
            };
            let amount = account.balance.abs();
            let (debit, credit) = if on_debit_side {
                (amount, Decimal::ZERO)
            } else {
                (Decimal::ZERO, amount)
            };
            total_debit += debit;
            total_credit += credit;

            rows.push(TrialBalanceRow {
                account_id: account.id,
                code: account.code,
                name: account.name,
                account_type: account.account_type,
                debit,
                credit,
            });
        }

        Ok(TrialBalance {
            entity_id,
            rows,
            total_debit,
            total_credit,
            generated_at: Utc::now(),
        })
    }

    /// Recompute an account's balance from its transactions
    pub async fn verify_account_balance(
        &self,
        ctx: &OperationContext,
        account_id: Uuid,
    ) -> AppResult<BalanceCheck> {
        let account = self.entity_account(ctx, account_id).await?;
        let transactions = self.store.list_account_transactions(account_id).await?;

        let recomputed: Decimal = transactions
            .iter()
            .map(|t| account.normal_balance.delta(t.debit, t.credit))
            .sum();
        let last_running_balance = transactions.last().map(|t| t.running_balance);

        let consistent = recomputed == account.balance
            && last_running_balance.map_or(true, |running| running == account.balance);

        if !consistent {
            tracing::warn!(
                account_id = %account_id,
                stored = %account.balance,
                recomputed = %recomputed,
                "Account balance does not match its transactions"
            );
        }

        Ok(BalanceCheck {
            account_id,
            stored: account.balance,
            recomputed,
            last_running_balance,
            consistent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::ChartService;
    use crate::domain::AccountRole;
    use crate::error::AppError;
    use crate::pipeline::{PostingService, PostingWorker, WorkerConfig};
    use crate::posting::{InvoiceIssued, InvoiceItem, ItemKind};
    use crate::store::InMemoryStore;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_trial_balance_after_invoice() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = OperationContext::new(Uuid::new_v4(), Uuid::new_v4());
        let bindings = ChartService::new(store.clone())
            .seed_default_chart(&ctx)
            .await
            .unwrap();

        PostingService::new(store.clone(), 3)
            .submit_invoice(
                &ctx,
                InvoiceIssued {
                    invoice_id: Uuid::new_v4(),
                    entity_id: ctx.entity_id,
                    number: "INV-7".into(),
                    date: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
                    items: vec![InvoiceItem {
                        kind: ItemKind::Product,
                        net: dec!(500),
                        tax: dec!(50),
                        track_inventory: true,
                        cost: dec!(300),
                    }],
                },
            )
            .await
            .unwrap();
        PostingWorker::new(store.clone(), WorkerConfig::default())
            .run_until_idle()
            .await
            .unwrap();

        let ledger = LedgerQueryService::new(store);
        let trial = ledger.trial_balance(ctx.entity_id).await.unwrap();
        assert!(trial.is_balanced());
        assert_eq!(trial.total_debit, dec!(850));

        // Inventory went negative: shown on the credit side
        let inventory = bindings.require(AccountRole::Inventory).unwrap().account_id;
        let row = trial.rows.iter().find(|r| r.account_id == inventory).unwrap();
        assert_eq!(row.credit, dec!(300));
        assert_eq!(row.debit, dec!(0));

        let ar = bindings.require(AccountRole::AccountsReceivable).unwrap().account_id;
        let statement = ledger.account_statement(&ctx, ar).await.unwrap();
        assert_eq!(statement.transactions.len(), 1);
        assert_eq!(statement.total_debit, dec!(550));

        let check = ledger.verify_account_balance(&ctx, ar).await.unwrap();
        assert!(check.consistent);
        assert_eq!(check.recomputed, dec!(550));
    }

    #[tokio::test]
    async fn test_foreign_account_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = OperationContext::new(Uuid::new_v4(), Uuid::new_v4());
        let bindings = ChartService::new(store.clone())
            .seed_default_chart(&ctx)
            .await
            .unwrap();
        let ar = bindings.require(AccountRole::AccountsReceivable).unwrap().account_id;

        let ledger = LedgerQueryService::new(store);
        let other = OperationContext::new(ctx.group_id, Uuid::new_v4());
        assert!(matches!(
            ledger.account_balance(&other, ar).await,
            Err(AppError::Domain(DomainError::AccountNotInEntity(_)))
        ));
        assert!(matches!(
            ledger.account_balance(&ctx, Uuid::new_v4()).await,
            Err(AppError::Domain(DomainError::NotFound(_)))
        ));
    }
}
