//! Domain module
//!
//! Core domain types and business logic.

pub mod account;
pub mod amount;
pub mod bindings;
pub mod chart;
pub mod context;
pub mod document;
pub mod error;
pub mod journal;

pub use account::{Account, NormalBalance};
pub use amount::{Amount, AmountError};
pub use bindings::{AccountRole, BoundAccount, ChartRoleBindings};
pub use chart::{AccountCategory, AccountSubCategory, AccountType};
pub use context::OperationContext;
pub use document::{DocumentKind, DocumentRecord, DocumentRef, PostingStatus};
pub use error::{DomainError, ErrorCategory};
pub use journal::{AccountTransaction, Journal, JournalDraft, JournalLine, TransactionType};
