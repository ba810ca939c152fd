//! Well-known account roles
//!
//! Posting rules never look accounts up by code. Each entity carries a
//! `ChartRoleBindings` value that maps every semantic role to a concrete
//! account, validated when the entity's chart is set up.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::account::{Account, NormalBalance};
use super::error::DomainError;

/// Semantic role an account plays for the posting rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    AccountsReceivable,
    AccountsPayable,
    TaxPayable,
    ProductRevenue,
    ServiceRevenue,
    CostOfGoodsSold,
    Inventory,
}

impl AccountRole {
    pub const ALL: [AccountRole; 7] = [
        AccountRole::AccountsReceivable,
        AccountRole::AccountsPayable,
        AccountRole::TaxPayable,
        AccountRole::ProductRevenue,
        AccountRole::ServiceRevenue,
        AccountRole::CostOfGoodsSold,
        AccountRole::Inventory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::AccountsReceivable => "accounts_receivable",
            AccountRole::AccountsPayable => "accounts_payable",
            AccountRole::TaxPayable => "tax_payable",
            AccountRole::ProductRevenue => "product_revenue",
            AccountRole::ServiceRevenue => "service_revenue",
            AccountRole::CostOfGoodsSold => "cost_of_goods_sold",
            AccountRole::Inventory => "inventory",
        }
    }

    /// Conventional account code seeded for this role
    pub fn default_code(&self) -> &'static str {
        match self {
            AccountRole::AccountsReceivable => "1120-01",
            AccountRole::Inventory => "1130-01",
            AccountRole::AccountsPayable => "2110-01",
            AccountRole::TaxPayable => "2140-01",
            AccountRole::ProductRevenue => "4110-01",
            AccountRole::ServiceRevenue => "4120-01",
            AccountRole::CostOfGoodsSold => "5110-01",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AccountRole::AccountsReceivable => "Accounts Receivable",
            AccountRole::AccountsPayable => "Accounts Payable",
            AccountRole::TaxPayable => "Tax Payable",
            AccountRole::ProductRevenue => "Product Revenue",
            AccountRole::ServiceRevenue => "Service Revenue",
            AccountRole::CostOfGoodsSold => "Cost of Goods Sold",
            AccountRole::Inventory => "Inventory",
        }
    }

    /// Side the bound account must grow on
    pub fn expected_normal_balance(&self) -> NormalBalance {
        match self {
            AccountRole::AccountsReceivable
            | AccountRole::Inventory
            | AccountRole::CostOfGoodsSold => NormalBalance::Debit,
            AccountRole::AccountsPayable
            | AccountRole::TaxPayable
            | AccountRole::ProductRevenue
            | AccountRole::ServiceRevenue => NormalBalance::Credit,
        }
    }
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AccountRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| DomainError::not_found(format!("account role '{}'", s)))
    }
}

/// Account bound to a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundAccount {
    pub account_id: Uuid,
    pub code: String,
    pub normal_balance: NormalBalance,
}

impl From<&Account> for BoundAccount {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id,
            code: account.code.clone(),
            normal_balance: account.normal_balance,
        }
    }
}

/// Per-entity role → account mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRoleBindings {
    pub entity_id: Uuid,
    accounts: BTreeMap<AccountRole, BoundAccount>,
}

impl ChartRoleBindings {
    pub fn new(entity_id: Uuid) -> Self {
        Self {
            entity_id,
            accounts: BTreeMap::new(),
        }
    }

    /// Bind `account` to `role`, checking entity and balance side.
    pub fn bind(&mut self, role: AccountRole, account: &Account) -> Result<(), DomainError> {
        if account.entity_id != self.entity_id {
            return Err(DomainError::AccountNotInEntity(account.id));
        }
        if account.normal_balance != role.expected_normal_balance() {
            return Err(DomainError::BusinessRuleViolation(format!(
                "account {} is {}-normal and cannot serve as {}",
                account.code, account.normal_balance, role
            )));
        }
        self.accounts.insert(role, BoundAccount::from(account));
        Ok(())
    }

    pub fn with(mut self, role: AccountRole, account: &Account) -> Result<Self, DomainError> {
        self.bind(role, account)?;
        Ok(self)
    }

    /// Account bound to `role`, or `MissingAccountConfiguration`
    pub fn require(&self, role: AccountRole) -> Result<&BoundAccount, DomainError> {
        self.accounts
            .get(&role)
            .ok_or(DomainError::MissingAccountConfiguration {
                role,
                entity_id: self.entity_id,
            })
    }

    pub fn get(&self, role: AccountRole) -> Option<&BoundAccount> {
        self.accounts.get(&role)
    }

    pub fn missing_roles(&self) -> Vec<AccountRole> {
        AccountRole::ALL
            .into_iter()
            .filter(|role| !self.accounts.contains_key(role))
            .collect()
    }

    /// Every role must be bound before the entity can post.
    pub fn validate_complete(&self) -> Result<(), DomainError> {
        match self.missing_roles().first() {
            Some(role) => Err(DomainError::missing_account(*role, self.entity_id)),
            None => Ok(()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AccountRole, &BoundAccount)> {
        self.accounts.iter()
    }
}
