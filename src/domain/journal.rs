//! Journals and account transactions
//!
//! A journal is one balanced, immutable posting event. Each of its lines
//! produces one denormalised account transaction carrying the account's
//! running balance after the line was applied.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::document::{DocumentRef, PostingStatus};
use super::error::DomainError;

/// Largest accepted difference between total debit and total credit
pub fn balance_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

// =========================================================================
// JournalLine
// =========================================================================

/// One line of a journal. Exactly one of `debit`/`credit` is positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawJournalLine")]
pub struct JournalLine {
    account_id: Uuid,
    debit: Decimal,
    credit: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
}

#[derive(Deserialize)]
struct RawJournalLine {
    account_id: Uuid,
    #[serde(default)]
    debit: Decimal,
    #[serde(default)]
    credit: Decimal,
    #[serde(default)]
    memo: Option<String>,
}

impl TryFrom<RawJournalLine> for JournalLine {
    type Error = DomainError;

    fn try_from(raw: RawJournalLine) -> Result<Self, Self::Error> {
        JournalLine::new(raw.account_id, raw.debit, raw.credit, raw.memo)
    }
}

impl JournalLine {
    /// Build a line, enforcing non-negative sides and debit-xor-credit.
    pub fn new(
        account_id: Uuid,
        debit: Decimal,
        credit: Decimal,
        memo: Option<String>,
    ) -> Result<Self, DomainError> {
        if debit < Decimal::ZERO || credit < Decimal::ZERO {
            return Err(DomainError::InvalidJournalLine(format!(
                "negative amount on account {}",
                account_id
            )));
        }
        let debit_side = debit > Decimal::ZERO;
        let credit_side = credit > Decimal::ZERO;
        if debit_side == credit_side {
            return Err(DomainError::InvalidJournalLine(format!(
                "account {} must carry exactly one of debit or credit",
                account_id
            )));
        }
        Ok(Self {
            account_id,
            debit,
            credit,
            memo,
        })
    }

    pub fn debit(account_id: Uuid, amount: Decimal) -> Result<Self, DomainError> {
        Self::new(account_id, amount, Decimal::ZERO, None)
    }

    pub fn credit(account_id: Uuid, amount: Decimal) -> Result<Self, DomainError> {
        Self::new(account_id, Decimal::ZERO, amount, None)
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn account_id(&self) -> Uuid {
        self.account_id
    }

    pub fn debit_amount(&self) -> Decimal {
        self.debit
    }

    pub fn credit_amount(&self) -> Decimal {
        self.credit
    }

    pub fn memo(&self) -> Option<&str> {
        self.memo.as_deref()
    }

    pub fn is_debit(&self) -> bool {
        self.debit > Decimal::ZERO
    }
}

// =========================================================================
// JournalDraft
// =========================================================================

/// Output of a posting rule: validated lines plus totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalDraft {
    pub lines: Vec<JournalLine>,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
}

impl JournalDraft {
    /// Compute totals and validate the balance invariant.
    pub fn from_lines(lines: Vec<JournalLine>) -> Result<Self, DomainError> {
        let total_debit = lines.iter().map(|l| l.debit).sum();
        let total_credit = lines.iter().map(|l| l.credit).sum();
        let draft = Self {
            lines,
            total_debit,
            total_credit,
        };
        draft.validate()?;
        Ok(draft)
    }

    /// Σdebit must equal Σcredit within the tolerance, with at least two
    /// lines and no account repeated.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.lines.len() < 2 {
            return Err(DomainError::InsufficientLines(self.lines.len()));
        }

        let mut seen = HashSet::with_capacity(self.lines.len());
        for line in &self.lines {
            if !seen.insert(line.account_id) {
                return Err(DomainError::DuplicateAccountLine(line.account_id));
            }
        }

        if (self.total_debit - self.total_credit).abs() > balance_tolerance() {
            return Err(DomainError::UnbalancedJournal {
                total_debit: self.total_debit,
                total_credit: self.total_credit,
            });
        }
        Ok(())
    }
}

// =========================================================================
// Journal
// =========================================================================

/// Immutable, balanced posting event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub reference: String,
    pub date: NaiveDate,
    pub description: String,
    pub source: DocumentRef,
    pub lines: Vec<JournalLine>,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Journal {
    /// Seal a validated draft into a journal
    pub fn from_draft(
        draft: JournalDraft,
        entity_id: Uuid,
        source: DocumentRef,
        date: NaiveDate,
        description: String,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_id,
            reference: source.journal_reference(created_at),
            date,
            description,
            source,
            lines: draft.lines,
            total_debit: draft.total_debit,
            total_credit: draft.total_credit,
            created_at,
        }
    }
}

// =========================================================================
// AccountTransaction
// =========================================================================

/// What produced an account transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Bank,
    InvoicePosting,
    PaymentReceivedPosting,
    ReceiptPosting,
    BillPosting,
    BillPaymentPosting,
    ExpensePosting,
    OpeningBalance,
}

impl TransactionType {
    const ALL: [TransactionType; 8] = [
        TransactionType::Bank,
        TransactionType::InvoicePosting,
        TransactionType::PaymentReceivedPosting,
        TransactionType::ReceiptPosting,
        TransactionType::BillPosting,
        TransactionType::BillPaymentPosting,
        TransactionType::ExpensePosting,
        TransactionType::OpeningBalance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Bank => "BANK",
            TransactionType::InvoicePosting => "INVOICE_POSTING",
            TransactionType::PaymentReceivedPosting => "PAYMENT_RECEIVED_POSTING",
            TransactionType::ReceiptPosting => "RECEIPT_POSTING",
            TransactionType::BillPosting => "BILL_POSTING",
            TransactionType::BillPaymentPosting => "BILL_PAYMENT_POSTING",
            TransactionType::ExpensePosting => "EXPENSE_POSTING",
            TransactionType::OpeningBalance => "OPENING_BALANCE",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::not_found(format!("transaction type '{}'", s)))
    }
}

/// One row per journal line, denormalised for querying
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTransaction {
    pub id: Uuid,
    pub journal_id: Uuid,
    pub entity_id: Uuid,
    pub account_id: Uuid,
    pub debit: Decimal,
    pub credit: Decimal,
    /// Account balance right after this line was applied
    pub running_balance: Decimal,
    pub transaction_type: TransactionType,
    pub status: PostingStatus,
    pub related: DocumentRef,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_line_requires_exactly_one_side() {
        let account = Uuid::new_v4();
        assert!(JournalLine::new(account, dec!(10), dec!(10), None).is_err());
        assert!(JournalLine::new(account, dec!(0), dec!(0), None).is_err());
        assert!(JournalLine::new(account, dec!(-1), dec!(0), None).is_err());
        assert!(JournalLine::debit(account, dec!(10)).unwrap().is_debit());
        assert!(!JournalLine::credit(account, dec!(10)).unwrap().is_debit());
    }

    #[test]
    fn test_line_deserialize_enforces_invariant() {
        let account = Uuid::new_v4();
        let ok = format!(r#"{{"account_id":"{}","debit":"25.50"}}"#, account);
        let line: JournalLine = serde_json::from_str(&ok).unwrap();
        assert_eq!(line.debit_amount(), dec!(25.50));
        assert_eq!(line.credit_amount(), Decimal::ZERO);

        let both = format!(
            r#"{{"account_id":"{}","debit":"1","credit":"1"}}"#,
            account
        );
        assert!(serde_json::from_str::<JournalLine>(&both).is_err());
    }

    #[test]
    fn test_draft_balanced() {
        let draft = JournalDraft::from_lines(vec![
            JournalLine::debit(Uuid::new_v4(), dec!(1100)).unwrap(),
            JournalLine::credit(Uuid::new_v4(), dec!(1000)).unwrap(),
            JournalLine::credit(Uuid::new_v4(), dec!(100)).unwrap(),
        ])
        .unwrap();
        assert_eq!(draft.total_debit, dec!(1100));
        assert_eq!(draft.total_credit, dec!(1100));
    }

    #[test]
    fn test_draft_tolerance() {
        let within = JournalDraft::from_lines(vec![
            JournalLine::debit(Uuid::new_v4(), dec!(100.01)).unwrap(),
            JournalLine::credit(Uuid::new_v4(), dec!(100)).unwrap(),
        ]);
        assert!(within.is_ok());

        let beyond = JournalDraft::from_lines(vec![
            JournalLine::debit(Uuid::new_v4(), dec!(100.02)).unwrap(),
            JournalLine::credit(Uuid::new_v4(), dec!(100)).unwrap(),
        ]);
        assert!(matches!(beyond, Err(DomainError::UnbalancedJournal { .. })));
    }

    #[test]
    fn test_draft_rejects_single_line_and_duplicates() {
        let account = Uuid::new_v4();
        assert!(matches!(
            JournalDraft::from_lines(vec![JournalLine::debit(account, dec!(1)).unwrap()]),
            Err(DomainError::InsufficientLines(1))
        ));
        assert!(matches!(
            JournalDraft::from_lines(vec![
                JournalLine::debit(account, dec!(1)).unwrap(),
                JournalLine::credit(account, dec!(1)).unwrap(),
            ]),
            Err(DomainError::DuplicateAccountLine(_))
        ));
    }

    #[test]
    fn test_transaction_type_strings() {
        assert_eq!(TransactionType::InvoicePosting.as_str(), "INVOICE_POSTING");
        assert_eq!(
            serde_json::to_string(&TransactionType::PaymentReceivedPosting).unwrap(),
            "\"PAYMENT_RECEIVED_POSTING\""
        );
        assert_eq!(
            "RECEIPT_POSTING".parse::<TransactionType>().unwrap(),
            TransactionType::ReceiptPosting
        );
    }
}
