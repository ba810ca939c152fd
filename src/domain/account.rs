//! Ledger account
//!
//! Accounts hang off a subcategory and belong to exactly one entity. The
//! balance is only ever moved by posting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::chart::{AccountSubCategory, AccountType};
use super::error::DomainError;

/// Side on which an account's balance grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalBalance {
    Debit,
    Credit,
}

impl NormalBalance {
    /// Balance change caused by one journal line.
    ///
    /// Debit-normal accounts move by `debit - credit`, credit-normal
    /// accounts by `credit - debit`.
    pub fn delta(&self, debit: Decimal, credit: Decimal) -> Decimal {
        match self {
            NormalBalance::Debit => debit - credit,
            NormalBalance::Credit => credit - debit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NormalBalance::Debit => "debit",
            NormalBalance::Credit => "credit",
        }
    }
}

impl fmt::Display for NormalBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NormalBalance {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(NormalBalance::Debit),
            "credit" => Ok(NormalBalance::Credit),
            other => Err(DomainError::not_found(format!("normal balance '{}'", other))),
        }
    }
}

/// Ledger account with its running balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub group_id: Uuid,
    pub entity_id: Uuid,
    pub sub_category_id: Uuid,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    /// Denormalised from the account type at creation
    pub normal_balance: NormalBalance,
    pub balance: Decimal,
    pub is_bank_account: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Open a new account with a zero balance under `sub_category`.
    pub fn open(
        entity_id: Uuid,
        sub_category: &AccountSubCategory,
        code: String,
        name: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: sub_category.group_id,
            entity_id,
            sub_category_id: sub_category.id,
            code,
            name,
            account_type: sub_category.account_type,
            normal_balance: sub_category.account_type.normal_balance(),
            balance: Decimal::ZERO,
            is_bank_account: false,
            created_at: Utc::now(),
        }
    }

    /// Mark the account as backing a bank account
    pub fn as_bank_account(mut self) -> Self {
        self.is_bank_account = true;
        self
    }

    /// Balance after applying one line, without mutating the account
    pub fn balance_after(&self, debit: Decimal, credit: Decimal) -> Decimal {
        self.balance + self.normal_balance.delta(debit, credit)
    }
}
