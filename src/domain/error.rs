//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::bindings::AccountRole;
use super::document::PostingStatus;

/// How a domain error should be treated by callers and by the posting worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing chart setup; not retryable until an operator fixes the chart
    Configuration,
    /// Rejected input or illegal state change; nothing was written
    Validation,
    /// Duplicate code or record
    Conflict,
    /// Referenced record does not exist
    NotFound,
}

/// Domain-specific errors
///
/// These errors represent business rule violations and domain invariant failures.
/// They are independent of the web/infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// A well-known account role has no account bound for the entity
    #[error("{role} not configured for entity {entity_id}")]
    MissingAccountConfiguration { role: AccountRole, entity_id: Uuid },

    /// Chart setup referenced a subcategory that does not exist
    #[error("Subcategory {code} not configured for group {group_id}")]
    MissingSubCategory { code: u32, group_id: Uuid },

    /// Debits and credits differ by more than the tolerance
    #[error("Unbalanced journal: total debit {total_debit}, total credit {total_credit}")]
    UnbalancedJournal {
        total_debit: Decimal,
        total_credit: Decimal,
    },

    /// A journal needs at least one debit and one credit line
    #[error("Journal must have at least 2 lines, got {0}")]
    InsufficientLines(usize),

    /// Two lines of one journal touch the same account
    #[error("Account {0} appears on more than one line of the journal")]
    DuplicateAccountLine(Uuid),

    /// A journal line is malformed (negative, both sides, or empty)
    #[error("Invalid journal line: {0}")]
    InvalidJournalLine(String),

    /// Invalid amount (zero, negative, or exceeds limit)
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Payment would settle more than the document's outstanding total
    #[error("Overpayment: total {total}, already settled {settled}, payment {amount}")]
    Overpayment {
        total: Decimal,
        settled: Decimal,
        amount: Decimal,
    },

    /// Posting status change not allowed by the state machine
    #[error("Invalid posting status transition: {from} -> {to}")]
    InvalidStatusTransition {
        from: PostingStatus,
        to: PostingStatus,
    },

    /// Finalized seeding records are immutable
    #[error("Record {0} is finalized and cannot be modified")]
    FinalizedRecord(Uuid),

    /// A referenced account belongs to another entity (or does not exist)
    #[error("Account {0} does not belong to the requesting entity")]
    AccountNotInEntity(Uuid),

    /// Explicit chart code outside the parent's band or not aligned to the step
    #[error("Code {code} is outside the band of parent {base} (step {step})")]
    CodeOutOfBand { code: u32, base: u32, step: u32 },

    /// All codes in a parent's band are used
    #[error("No free code left under parent {base}")]
    CodeBandExhausted { base: u32 },

    /// Duplicate record
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Business rule violation
    #[error("Business rule violation: {0}")]
    BusinessRuleViolation(String),
}

impl DomainError {
    /// Create a missing account configuration error
    pub fn missing_account(role: AccountRole, entity_id: Uuid) -> Self {
        Self::MissingAccountConfiguration { role, entity_id }
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a conflict error
    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingAccountConfiguration { .. } | Self::MissingSubCategory { .. } => {
                ErrorCategory::Configuration
            }
            Self::Conflict(_) | Self::CodeBandExhausted { .. } => ErrorCategory::Conflict,
            Self::NotFound(_) => ErrorCategory::NotFound,
            _ => ErrorCategory::Validation,
        }
    }

    /// Stable machine-readable code, stored on failed documents
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingAccountConfiguration { .. } => "missing_account_configuration",
            Self::MissingSubCategory { .. } => "missing_sub_category",
            Self::UnbalancedJournal { .. } => "unbalanced_journal",
            Self::InsufficientLines(_) => "insufficient_lines",
            Self::DuplicateAccountLine(_) => "duplicate_account_line",
            Self::InvalidJournalLine(_) => "invalid_journal_line",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::Overpayment { .. } => "overpayment",
            Self::InvalidStatusTransition { .. } => "invalid_status_transition",
            Self::FinalizedRecord(_) => "finalized_record",
            Self::AccountNotInEntity(_) => "account_not_in_entity",
            Self::CodeOutOfBand { .. } => "code_out_of_band",
            Self::CodeBandExhausted { .. } => "code_band_exhausted",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::BusinessRuleViolation(_) => "business_rule_violation",
        }
    }

    /// Check if this is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }
}

impl From<super::AmountError> for DomainError {
    fn from(err: super::AmountError) -> Self {
        Self::InvalidAmount(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_account_message() {
        let entity_id = Uuid::nil();
        let err = DomainError::missing_account(AccountRole::AccountsReceivable, entity_id);

        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(err.error_code(), "missing_account_configuration");
        assert!(err.to_string().contains("Accounts Receivable not configured"));
    }

    #[test]
    fn test_overpayment_is_validation() {
        let err = DomainError::Overpayment {
            total: Decimal::new(1000, 0),
            settled: Decimal::new(1000, 0),
            amount: Decimal::ONE,
        };

        assert!(err.is_client_error());
        assert!(err.to_string().contains("1000"));
    }

    #[test]
    fn test_conflict_and_not_found_categories() {
        assert_eq!(
            DomainError::conflict("code 1100").category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            DomainError::not_found("category").category(),
            ErrorCategory::NotFound
        );
        assert!(!DomainError::conflict("x").is_client_error());
    }
}
