//! Chart of accounts service
//!
//! Category, subcategory and account creation with generated codes, the
//! default chart every new entity starts from, and role binding.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::chart::{
    account_code, next_account_suffix, next_category_code, next_sub_category_code,
    validate_code, CATEGORY_BAND, CATEGORY_STEP, SUB_CATEGORY_BAND, SUB_CATEGORY_STEP,
};
use crate::domain::{
    Account, AccountCategory, AccountRole, AccountSubCategory, AccountType, ChartRoleBindings,
    DomainError, OperationContext,
};
use crate::error::AppResult;
use crate::store::Store;

/// Subcategory holding cash and bank ledger accounts
pub const CASH_AND_BANK_SUB_CATEGORY: u32 = 1110;

/// (subcategory code, subcategory name, account name)
type SeedSubCategory = (u32, &'static str, &'static str);

/// Default chart: per category, its subcategories with one account each
const DEFAULT_CHART: &[(AccountType, u32, &str, &[SeedSubCategory])] = &[
    (
        AccountType::Assets,
        1100,
        "Current Assets",
        &[
            (1110, "Cash & Bank", "Cash"),
            (1120, "Accounts Receivable", "Accounts Receivable"),
            (1130, "Inventory", "Inventory"),
        ],
    ),
    (
        AccountType::Liabilities,
        2100,
        "Current Liabilities",
        &[
            (2110, "Accounts Payable", "Accounts Payable"),
            (2140, "Tax Payable", "Tax Payable"),
        ],
    ),
    (AccountType::Equity, 3100, "Owner's Equity", &[]),
    (
        AccountType::Revenue,
        4100,
        "Operating Revenue",
        &[
            (4110, "Product Revenue", "Product Revenue"),
            (4120, "Service Revenue", "Service Revenue"),
        ],
    ),
    (
        AccountType::Expenses,
        5100,
        "Cost of Sales",
        &[(5110, "Cost of Goods Sold", "Cost of Goods Sold")],
    ),
    (
        AccountType::Expenses,
        5200,
        "Operating Expenses",
        &[(5210, "General Expenses", "General Expense")],
    ),
];

/// Chart of accounts operations scoped by `OperationContext`
#[derive(Clone)]
pub struct ChartService {
    store: Arc<dyn Store>,
}

impl ChartService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The fixed five-type taxonomy
    pub fn account_types(&self) -> Vec<AccountType> {
        AccountType::ALL.to_vec()
    }

    /// Create a category under an account type.
    ///
    /// Without `code` the next free slot of the type's band is used; an
    /// explicit code must sit on the 100-step grid inside the band.
    pub async fn create_category(
        &self,
        ctx: &OperationContext,
        account_type: AccountType,
        name: impl Into<String>,
        code: Option<u32>,
    ) -> AppResult<AccountCategory> {
        let code = match code {
            Some(code) => {
                validate_code(code, account_type.code(), CATEGORY_STEP, CATEGORY_BAND)?;
                code
            }
            None => {
                let siblings: Vec<u32> = self
                    .store
                    .list_categories(ctx.group_id)
                    .await?
                    .iter()
                    .map(|c| c.code)
                    .collect();
                next_category_code(account_type, &siblings)?
            }
        };

        let category = AccountCategory {
            id: Uuid::new_v4(),
            group_id: ctx.group_id,
            account_type,
            code,
            name: name.into(),
            created_at: Utc::now(),
        };
        self.store.insert_category(&category).await?;

        tracing::info!(
            group_id = %ctx.group_id,
            category_id = %category.id,
            code = category.code,
            "Category created"
        );
        Ok(category)
    }

    /// Create a subcategory under a category of the caller's group
    pub async fn create_sub_category(
        &self,
        ctx: &OperationContext,
        category_id: Uuid,
        name: impl Into<String>,
        code: Option<u32>,
    ) -> AppResult<AccountSubCategory> {
        let category = self
            .store
            .get_category(category_id)
            .await?
            .filter(|c| c.group_id == ctx.group_id)
            .ok_or_else(|| DomainError::not_found(format!("category {}", category_id)))?;

        let code = match code {
            Some(code) => {
                validate_code(code, category.code, SUB_CATEGORY_STEP, SUB_CATEGORY_BAND)?;
                code
            }
            None => {
                let siblings: Vec<u32> = self
                    .store
                    .list_sub_categories(category.id)
                    .await?
                    .iter()
                    .map(|s| s.code)
                    .collect();
                next_sub_category_code(category.code, &siblings)?
            }
        };

        let sub_category = AccountSubCategory {
            id: Uuid::new_v4(),
            group_id: ctx.group_id,
            category_id: category.id,
            account_type: category.account_type,
            code,
            name: name.into(),
            created_at: Utc::now(),
        };
        self.store.insert_sub_category(&sub_category).await?;

        tracing::info!(
            group_id = %ctx.group_id,
            sub_category_id = %sub_category.id,
            code = sub_category.code,
            "Subcategory created"
        );
        Ok(sub_category)
    }

    /// Open an account `{subCategoryCode}-{suffix}` for the caller's entity
    pub async fn create_account(
        &self,
        ctx: &OperationContext,
        sub_category_id: Uuid,
        name: impl Into<String>,
        suffix: Option<u32>,
    ) -> AppResult<Account> {
        let sub_category = self
            .store
            .get_sub_category(sub_category_id)
            .await?
            .filter(|s| s.group_id == ctx.group_id)
            .ok_or_else(|| DomainError::not_found(format!("subcategory {}", sub_category_id)))?;

        let account = self
            .open_account(ctx, &sub_category, name.into(), suffix, false)
            .await?;
        Ok(account)
    }

    /// Ledger account backing a bank account, under Cash & Bank
    pub async fn create_bank_account(
        &self,
        ctx: &OperationContext,
        name: impl Into<String>,
    ) -> AppResult<Account> {
        let sub_category = self
            .store
            .find_sub_category_by_code(ctx.group_id, CASH_AND_BANK_SUB_CATEGORY)
            .await?
            .ok_or(DomainError::MissingSubCategory {
                code: CASH_AND_BANK_SUB_CATEGORY,
                group_id: ctx.group_id,
            })?;

        self.open_account(ctx, &sub_category, name.into(), None, true)
            .await
    }

    async fn open_account(
        &self,
        ctx: &OperationContext,
        sub_category: &AccountSubCategory,
        name: String,
        suffix: Option<u32>,
        is_bank_account: bool,
    ) -> AppResult<Account> {
        let suffix = match suffix {
            Some(suffix) if (1..=99).contains(&suffix) => suffix,
            Some(suffix) => {
                return Err(DomainError::CodeOutOfBand {
                    code: suffix,
                    base: sub_category.code,
                    step: 1,
                }
                .into())
            }
            None => {
                let accounts = self.store.list_accounts(ctx.entity_id).await?;
                next_account_suffix(sub_category.code, accounts.iter().map(|a| a.code.as_str()))?
            }
        };

        let mut account = Account::open(
            ctx.entity_id,
            sub_category,
            account_code(sub_category.code, suffix),
            name,
        );
        if is_bank_account {
            account = account.as_bank_account();
        }
        self.store.insert_account(&account).await?;

        tracing::info!(
            entity_id = %ctx.entity_id,
            account_id = %account.id,
            code = %account.code,
            bank = account.is_bank_account,
            "Account opened"
        );
        Ok(account)
    }

    /// Seed the default chart for the caller's entity and bind every role.
    ///
    /// Safe to run again: existing categories, subcategories and accounts
    /// are reused.
    pub async fn seed_default_chart(&self, ctx: &OperationContext) -> AppResult<ChartRoleBindings> {
        let categories = self.store.list_categories(ctx.group_id).await?;

        for (account_type, category_code, category_name, subs) in DEFAULT_CHART {
            let category = match categories.iter().find(|c| c.code == *category_code) {
                Some(existing) => existing.clone(),
                None => {
                    self.create_category(ctx, *account_type, *category_name, Some(*category_code))
                        .await?
                }
            };

            for (sub_code, sub_name, account_name) in subs.iter() {
                let sub_category = match self
                    .store
                    .find_sub_category_by_code(ctx.group_id, *sub_code)
                    .await?
                {
                    Some(existing) => existing,
                    None => {
                        self.create_sub_category(ctx, category.id, *sub_name, Some(*sub_code))
                            .await?
                    }
                };

                let code = account_code(sub_category.code, 1);
                if self
                    .store
                    .find_account_by_code(ctx.entity_id, &code)
                    .await?
                    .is_none()
                {
                    let is_bank = sub_category.code == CASH_AND_BANK_SUB_CATEGORY;
                    self.open_account(ctx, &sub_category, account_name.to_string(), Some(1), is_bank)
                        .await?;
                }
            }
        }

        self.bind_roles(ctx).await
    }

    /// Resolve every role to its conventional account and persist the
    /// bindings. Fails on the first role without an account.
    pub async fn bind_roles(&self, ctx: &OperationContext) -> AppResult<ChartRoleBindings> {
        let mut bindings = ChartRoleBindings::new(ctx.entity_id);

        for role in AccountRole::ALL {
            let account = self
                .store
                .find_account_by_code(ctx.entity_id, role.default_code())
                .await?
                .ok_or_else(|| DomainError::missing_account(role, ctx.entity_id))?;
            bindings.bind(role, &account)?;
        }
        bindings.validate_complete()?;

        self.store.save_bindings(&bindings).await?;

        tracing::info!(entity_id = %ctx.entity_id, "Account roles bound");
        Ok(bindings)
    }

    /// Bindings currently persisted for the caller's entity
    pub async fn bindings(&self, ctx: &OperationContext) -> AppResult<ChartRoleBindings> {
        Ok(self.store.load_bindings(ctx.entity_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::store::{ChartStore, InMemoryStore};

    fn service() -> (ChartService, Arc<InMemoryStore>, OperationContext) {
        let store = Arc::new(InMemoryStore::new());
        let ctx = OperationContext::new(Uuid::new_v4(), Uuid::new_v4());
        (ChartService::new(store.clone()), store, ctx)
    }

    #[tokio::test]
    async fn test_generated_codes_are_monotonic() {
        let (chart, _, ctx) = service();
        assert_eq!(chart.account_types().len(), 5);

        let first = chart
            .create_category(&ctx, AccountType::Assets, "Current Assets", None)
            .await
            .unwrap();
        let second = chart
            .create_category(&ctx, AccountType::Assets, "Fixed Assets", None)
            .await
            .unwrap();
        let revenue = chart
            .create_category(&ctx, AccountType::Revenue, "Sales", None)
            .await
            .unwrap();
        assert_eq!(first.code, 1100);
        assert_eq!(second.code, 1200);
        assert_eq!(revenue.code, 4100);

        let sub_a = chart
            .create_sub_category(&ctx, first.id, "Cash", None)
            .await
            .unwrap();
        let sub_b = chart
            .create_sub_category(&ctx, first.id, "Receivables", None)
            .await
            .unwrap();
        assert_eq!(sub_a.code, 1110);
        assert_eq!(sub_b.code, 1120);
        assert_eq!(sub_b.account_type, AccountType::Assets);

        let acc_1 = chart.create_account(&ctx, sub_a.id, "Petty Cash", None).await.unwrap();
        let acc_2 = chart.create_account(&ctx, sub_a.id, "Till", None).await.unwrap();
        assert_eq!(acc_1.code, "1110-01");
        assert_eq!(acc_2.code, "1110-02");
    }

    #[tokio::test]
    async fn test_explicit_codes_are_validated() {
        let (chart, _, ctx) = service();

        let result = chart
            .create_category(&ctx, AccountType::Assets, "Bad", Some(2100))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::CodeOutOfBand { code: 2100, .. }))
        ));

        let result = chart
            .create_category(&ctx, AccountType::Assets, "Misaligned", Some(1150))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::CodeOutOfBand { .. }))
        ));

        chart
            .create_category(&ctx, AccountType::Assets, "Current", Some(1100))
            .await
            .unwrap();
        let duplicate = chart
            .create_category(&ctx, AccountType::Assets, "Again", Some(1100))
            .await;
        assert!(matches!(
            duplicate,
            Err(AppError::Domain(DomainError::Conflict(_)))
        ));
    }

    #[tokio::test]
    async fn test_unknown_parent_is_not_found() {
        let (chart, _, ctx) = service();

        let result = chart
            .create_sub_category(&ctx, Uuid::new_v4(), "Orphan", None)
            .await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::NotFound(_)))
        ));

        // Category of another group is invisible
        let other = OperationContext::new(Uuid::new_v4(), Uuid::new_v4());
        let foreign = chart
            .create_category(&other, AccountType::Assets, "Theirs", None)
            .await
            .unwrap();
        let result = chart.create_sub_category(&ctx, foreign.id, "Mine", None).await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_seed_default_chart_is_idempotent() {
        let (chart, store, ctx) = service();

        let bindings = chart.seed_default_chart(&ctx).await.unwrap();
        assert!(bindings.missing_roles().is_empty());

        let accounts = store.list_accounts(ctx.entity_id).await.unwrap();
        let codes: Vec<&str> = accounts.iter().map(|a| a.code.as_str()).collect();
        assert_eq!(
            codes,
            vec![
                "1110-01", "1120-01", "1130-01", "2110-01", "2140-01", "4110-01", "4120-01",
                "5110-01", "5210-01"
            ]
        );
        assert!(accounts[0].is_bank_account);

        chart.seed_default_chart(&ctx).await.unwrap();
        assert_eq!(store.list_accounts(ctx.entity_id).await.unwrap().len(), 9);

        let loaded = chart.bindings(&ctx).await.unwrap();
        assert_eq!(
            loaded.require(AccountRole::AccountsReceivable).unwrap().code,
            "1120-01"
        );
    }

    #[tokio::test]
    async fn test_second_entity_reuses_group_chart() {
        let (chart, store, ctx) = service();
        chart.seed_default_chart(&ctx).await.unwrap();

        let sibling = OperationContext::new(ctx.group_id, Uuid::new_v4());
        chart.seed_default_chart(&sibling).await.unwrap();

        assert_eq!(store.list_categories(ctx.group_id).await.unwrap().len(), 6);
        assert_eq!(store.list_accounts(sibling.entity_id).await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_bind_roles_requires_every_account() {
        let (chart, _, ctx) = service();
        let category = chart
            .create_category(&ctx, AccountType::Assets, "Current Assets", Some(1100))
            .await
            .unwrap();
        let receivables = chart
            .create_sub_category(&ctx, category.id, "Receivables", Some(1120))
            .await
            .unwrap();
        chart
            .create_account(&ctx, receivables.id, "AR", None)
            .await
            .unwrap();

        let result = chart.bind_roles(&ctx).await;
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::MissingAccountConfiguration {
                role: AccountRole::AccountsPayable,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_bank_accounts() {
        let (chart, _, ctx) = service();

        let missing = chart.create_bank_account(&ctx, "Checking").await;
        assert!(matches!(
            missing,
            Err(AppError::Domain(DomainError::MissingSubCategory { code: 1110, .. }))
        ));

        chart.seed_default_chart(&ctx).await.unwrap();
        let checking = chart.create_bank_account(&ctx, "Checking").await.unwrap();
        assert_eq!(checking.code, "1110-02");
        assert!(checking.is_bank_account);
        assert_eq!(checking.account_type, AccountType::Assets);
    }
}
