//! Posting rule library
//!
//! Business events and the pure rules mapping them to journal lines.

pub mod events;
pub mod rules;

pub use events::{
    BillPayment, CashReceipt, DirectExpense, ExpenseLine, InvoiceIssued, InvoiceItem, ItemKind,
    PaymentReceived, PostingEvent, SaleLine, VendorBill,
};
pub use rules::{build_journal, check_settlement};
