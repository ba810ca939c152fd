//! Chart of Accounts model
//!
//! Fixed Type → Category → SubCategory → Account hierarchy with
//! deterministic, band-based numeric code generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::account::NormalBalance;
use super::error::DomainError;

/// Categories under a type are numbered in steps of 100.
pub const CATEGORY_STEP: u32 = 100;
/// A type owns a band of 1000 codes.
pub const CATEGORY_BAND: u32 = 1000;
/// Subcategories under a category are numbered in steps of 10.
pub const SUB_CATEGORY_STEP: u32 = 10;
/// A category owns a band of 100 codes.
pub const SUB_CATEGORY_BAND: u32 = 100;

// =========================================================================
// AccountType
// =========================================================================

/// Fixed, system-wide account taxonomy. One type per 1000-code band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Assets,
    Liabilities,
    Equity,
    Revenue,
    Expenses,
}

impl AccountType {
    pub const ALL: [AccountType; 5] = [
        AccountType::Assets,
        AccountType::Liabilities,
        AccountType::Equity,
        AccountType::Revenue,
        AccountType::Expenses,
    ];

    /// Numeric band start (1000, 2000, ...)
    pub fn code(&self) -> u32 {
        match self {
            AccountType::Assets => 1000,
            AccountType::Liabilities => 2000,
            AccountType::Equity => 3000,
            AccountType::Revenue => 4000,
            AccountType::Expenses => 5000,
        }
    }

    /// Four-digit code string
    pub fn code_str(&self) -> String {
        format!("{:04}", self.code())
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccountType::Assets => "Assets",
            AccountType::Liabilities => "Liabilities",
            AccountType::Equity => "Equity",
            AccountType::Revenue => "Revenue",
            AccountType::Expenses => "Expenses",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Assets => "assets",
            AccountType::Liabilities => "liabilities",
            AccountType::Equity => "equity",
            AccountType::Revenue => "revenue",
            AccountType::Expenses => "expenses",
        }
    }

    /// Resolve the type owning the 1000-band that contains `code`.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| code >= t.code() && code < t.code() + CATEGORY_BAND)
    }

    /// Side on which this type's balances grow
    pub fn normal_balance(&self) -> NormalBalance {
        match self {
            AccountType::Assets | AccountType::Expenses => NormalBalance::Debit,
            AccountType::Liabilities | AccountType::Equity | AccountType::Revenue => {
                NormalBalance::Credit
            }
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AccountType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::not_found(format!("account type '{}'", s)))
    }
}

// =========================================================================
// Category / SubCategory
// =========================================================================

/// Group-scoped category under an account type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCategory {
    pub id: Uuid,
    pub group_id: Uuid,
    pub account_type: AccountType,
    pub code: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Subcategory under a category; accounts hang off subcategories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSubCategory {
    pub id: Uuid,
    pub group_id: Uuid,
    pub category_id: Uuid,
    pub account_type: AccountType,
    pub code: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// =========================================================================
// Code generation
// =========================================================================

/// Next code in a fixed-width numeric band.
///
/// Only siblings inside `[base, base + band)` are considered. Without any,
/// the first code is `base + step`; otherwise `max + step`. The result must
/// stay inside the band.
pub fn next_code(base: u32, step: u32, band: u32, siblings: &[u32]) -> Result<u32, DomainError> {
    let max = siblings
        .iter()
        .copied()
        .filter(|code| *code >= base && *code < base + band)
        .max();

    let next = match max {
        Some(max) => max + step,
        None => base + step,
    };

    if next > base + band - step {
        return Err(DomainError::CodeBandExhausted { base });
    }
    Ok(next)
}

/// Validate an explicitly supplied code against its parent's band.
pub fn validate_code(code: u32, base: u32, step: u32, band: u32) -> Result<(), DomainError> {
    let in_band = code >= base && code <= base + band - step;
    if !in_band || (code - base) % step != 0 {
        return Err(DomainError::CodeOutOfBand { code, base, step });
    }
    Ok(())
}

/// Next category code under an account type
pub fn next_category_code(account_type: AccountType, siblings: &[u32]) -> Result<u32, DomainError> {
    next_code(account_type.code(), CATEGORY_STEP, CATEGORY_BAND, siblings)
}

/// Next subcategory code under a category
pub fn next_sub_category_code(category_code: u32, siblings: &[u32]) -> Result<u32, DomainError> {
    next_code(category_code, SUB_CATEGORY_STEP, SUB_CATEGORY_BAND, siblings)
}

/// Account code `{subCategoryCode}-{suffix}` with a two-digit suffix
pub fn account_code(sub_category_code: u32, suffix: u32) -> String {
    format!("{}-{:02}", sub_category_code, suffix)
}

/// Split an account code into its subcategory code and suffix.
pub fn parse_account_code(code: &str) -> Option<(u32, u32)> {
    let (sub, suffix) = code.split_once('-')?;
    Some((sub.parse().ok()?, suffix.parse().ok()?))
}

/// Next free suffix for accounts of one subcategory (1-based, max 99).
pub fn next_account_suffix<'a>(
    sub_category_code: u32,
    existing_codes: impl IntoIterator<Item = &'a str>,
) -> Result<u32, DomainError> {
    let max = existing_codes
        .into_iter()
        .filter_map(parse_account_code)
        .filter(|(sub, _)| *sub == sub_category_code)
        .map(|(_, suffix)| suffix)
        .max()
        .unwrap_or(0);

    if max >= 99 {
        return Err(DomainError::CodeBandExhausted {
            base: sub_category_code,
        });
    }
    Ok(max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_bands() {
        assert_eq!(AccountType::Assets.code_str(), "1000");
        assert_eq!(AccountType::from_code(1120), Some(AccountType::Assets));
        assert_eq!(AccountType::from_code(4999), Some(AccountType::Revenue));
        assert_eq!(AccountType::from_code(6000), None);
        assert_eq!(AccountType::from_code(999), None);
    }

    #[test]
    fn test_normal_balance_by_type() {
        assert_eq!(AccountType::Assets.normal_balance(), NormalBalance::Debit);
        assert_eq!(AccountType::Expenses.normal_balance(), NormalBalance::Debit);
        assert_eq!(AccountType::Liabilities.normal_balance(), NormalBalance::Credit);
        assert_eq!(AccountType::Equity.normal_balance(), NormalBalance::Credit);
        assert_eq!(AccountType::Revenue.normal_balance(), NormalBalance::Credit);
    }

    #[test]
    fn test_first_category_code() {
        assert_eq!(next_category_code(AccountType::Assets, &[]).unwrap(), 1100);
    }

    #[test]
    fn test_category_codes_strictly_increase() {
        let mut siblings = Vec::new();
        let mut previous = AccountType::Revenue.code();
        for _ in 0..9 {
            let code = next_category_code(AccountType::Revenue, &siblings).unwrap();
            assert!(code > previous);
            assert_eq!(code - previous, CATEGORY_STEP);
            siblings.push(code);
            previous = code;
        }
        assert_eq!(previous, 4900);
        assert!(matches!(
            next_category_code(AccountType::Revenue, &siblings),
            Err(DomainError::CodeBandExhausted { base: 4000 })
        ));
    }

    #[test]
    fn test_next_code_skips_past_manual_codes() {
        // A manually supplied 1500 pushes generation past it
        let code = next_category_code(AccountType::Assets, &[1100, 1500]).unwrap();
        assert_eq!(code, 1600);
    }

    #[test]
    fn test_next_code_ignores_other_bands() {
        let code = next_sub_category_code(1100, &[1110, 1120, 1210, 2110]).unwrap();
        assert_eq!(code, 1130);
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code(1300, 1000, CATEGORY_STEP, CATEGORY_BAND).is_ok());
        assert!(validate_code(1900, 1000, CATEGORY_STEP, CATEGORY_BAND).is_ok());
        assert!(validate_code(2000, 1000, CATEGORY_STEP, CATEGORY_BAND).is_err());
        assert!(validate_code(1150, 1000, CATEGORY_STEP, CATEGORY_BAND).is_err());
        assert!(validate_code(1190, 1100, SUB_CATEGORY_STEP, SUB_CATEGORY_BAND).is_ok());
        assert!(validate_code(1200, 1100, SUB_CATEGORY_STEP, SUB_CATEGORY_BAND).is_err());
    }

    #[test]
    fn test_account_codes() {
        assert_eq!(account_code(1120, 1), "1120-01");
        assert_eq!(parse_account_code("2140-01"), Some((2140, 1)));
        assert_eq!(parse_account_code("garbage"), None);

        let existing = ["1110-01", "1110-03", "1120-07"];
        assert_eq!(next_account_suffix(1110, existing).unwrap(), 4);
        assert_eq!(next_account_suffix(1130, existing).unwrap(), 1);
    }
}
