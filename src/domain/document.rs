//! Business documents and their posting state
//!
//! Invoices, payments, receipts, bills and expenses trigger postings. Only
//! the posting-relevant part of each document is modelled here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::DomainError;
use super::journal::TransactionType;

/// Kind of business document that can be posted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Invoice,
    PaymentReceived,
    Receipt,
    Bill,
    PaymentMade,
    Expense,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 6] = [
        DocumentKind::Invoice,
        DocumentKind::PaymentReceived,
        DocumentKind::Receipt,
        DocumentKind::Bill,
        DocumentKind::PaymentMade,
        DocumentKind::Expense,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "invoice",
            DocumentKind::PaymentReceived => "payment_received",
            DocumentKind::Receipt => "receipt",
            DocumentKind::Bill => "bill",
            DocumentKind::PaymentMade => "payment_made",
            DocumentKind::Expense => "expense",
        }
    }

    /// Name of the queue job that posts this kind of document
    pub fn job_name(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "post_invoice",
            DocumentKind::PaymentReceived => "post_payment_received",
            DocumentKind::Receipt => "post_receipt",
            DocumentKind::Bill => "post_bill",
            DocumentKind::PaymentMade => "post_bill_payment",
            DocumentKind::Expense => "post_expense",
        }
    }

    /// Type recorded on the account transactions this document produces
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            DocumentKind::Invoice => TransactionType::InvoicePosting,
            DocumentKind::PaymentReceived => TransactionType::PaymentReceivedPosting,
            DocumentKind::Receipt => TransactionType::ReceiptPosting,
            DocumentKind::Bill => TransactionType::BillPosting,
            DocumentKind::PaymentMade => TransactionType::BillPaymentPosting,
            DocumentKind::Expense => TransactionType::ExpensePosting,
        }
    }

    /// Prefix used for human journal references
    fn reference_prefix(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "INV",
            DocumentKind::PaymentReceived => "PMT",
            DocumentKind::Receipt => "RCT",
            DocumentKind::Bill => "BIL",
            DocumentKind::PaymentMade => "BPY",
            DocumentKind::Expense => "EXP",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::not_found(format!("document kind '{}'", s)))
    }
}

/// Polymorphic back-pointer to a business document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentRef {
    pub kind: DocumentKind,
    pub id: Uuid,
}

impl DocumentRef {
    pub fn new(kind: DocumentKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    /// Journal reference for a posting of this document, e.g.
    /// `JV-INV-20260305-1a2b3c4d00004000a000000000000001`. The full id keeps
    /// references unique across tenants.
    pub fn journal_reference(&self, posted_at: DateTime<Utc>) -> String {
        format!(
            "JV-{}-{}-{}",
            self.kind.reference_prefix(),
            posted_at.format("%Y%m%d"),
            self.id.simple()
        )
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// =========================================================================
// PostingStatus state machine
// =========================================================================

/// Posting status of a business document (also used on account transactions)
///
/// ```text
/// Pending --> Processing --> Success
///                  |
///                  v
///               Failed --> Pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl PostingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostingStatus::Pending => "pending",
            PostingStatus::Processing => "processing",
            PostingStatus::Success => "success",
            PostingStatus::Failed => "failed",
        }
    }

    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(&self, next: PostingStatus) -> bool {
        use PostingStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Success) | (Processing, Failed) | (Failed, Pending)
        )
    }

    /// Validate `self -> next`
    pub fn transition(&self, next: PostingStatus) -> Result<PostingStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidStatusTransition {
                from: *self,
                to: next,
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostingStatus::Success)
    }
}

impl fmt::Display for PostingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostingStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PostingStatus::Pending),
            "processing" => Ok(PostingStatus::Processing),
            "success" => Ok(PostingStatus::Success),
            "failed" => Ok(PostingStatus::Failed),
            other => Err(DomainError::not_found(format!("posting status '{}'", other))),
        }
    }
}

// =========================================================================
// DocumentRecord
// =========================================================================

/// Posting-relevant state of one business document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub reference: DocumentRef,
    pub entity_id: Uuid,
    /// Document total (what payments may settle at most)
    pub total: Decimal,
    /// Sum of payments recorded against this document
    pub amount_settled: Decimal,
    pub posting_status: PostingStatus,
    pub journal_id: Option<Uuid>,
    pub journal_reference: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    /// Posting attempts that ended in Failed
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// New pending document
    pub fn pending(reference: DocumentRef, entity_id: Uuid, total: Decimal) -> Self {
        let now = Utc::now();
        Self {
            reference,
            entity_id,
            total,
            amount_settled: Decimal::ZERO,
            posting_status: PostingStatus::Pending,
            journal_id: None,
            journal_reference: None,
            posted_at: None,
            error_message: None,
            error_code: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Amount still open for settlement
    pub fn outstanding(&self) -> Decimal {
        self.total - self.amount_settled
    }
}
