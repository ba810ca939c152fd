//! Posting events
//!
//! Minimal, denormalised description of a business event: only the IDs and
//! amounts needed to rebuild its journal. These travel as job payloads.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::amount::non_negative;
use crate::domain::{Amount, DocumentKind, DocumentRef, DomainError};

/// Product or service line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Product,
    Service,
}

/// Sales line with pre-computed net and tax
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLine {
    pub kind: ItemKind,
    pub net: Decimal,
    #[serde(default)]
    pub tax: Decimal,
}

/// Invoice line; `cost` is the line's total cost price for tracked products
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub kind: ItemKind,
    pub net: Decimal,
    #[serde(default)]
    pub tax: Decimal,
    #[serde(default)]
    pub track_inventory: bool,
    #[serde(default)]
    pub cost: Decimal,
}

impl InvoiceItem {
    /// Cost moved from inventory to COGS when this item is posted
    pub fn inventory_cost(&self) -> Decimal {
        if self.kind == ItemKind::Product && self.track_inventory && self.cost > Decimal::ZERO {
            self.cost
        } else {
            Decimal::ZERO
        }
    }
}

/// Purchase line charged to an expense account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseLine {
    pub expense_account_id: Uuid,
    pub net: Decimal,
    #[serde(default)]
    pub tax: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceIssued {
    pub invoice_id: Uuid,
    pub entity_id: Uuid,
    pub number: String,
    pub date: NaiveDate,
    pub items: Vec<InvoiceItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceived {
    pub payment_id: Uuid,
    pub entity_id: Uuid,
    pub invoice_id: Uuid,
    pub number: String,
    pub date: NaiveDate,
    pub amount: Amount,
    /// Bank or cash account receiving the money
    pub deposit_account_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashReceipt {
    pub receipt_id: Uuid,
    pub entity_id: Uuid,
    pub number: String,
    pub date: NaiveDate,
    pub deposit_account_id: Uuid,
    pub items: Vec<SaleLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorBill {
    pub bill_id: Uuid,
    pub entity_id: Uuid,
    pub number: String,
    pub date: NaiveDate,
    pub items: Vec<ExpenseLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillPayment {
    pub payment_id: Uuid,
    pub entity_id: Uuid,
    pub bill_id: Uuid,
    pub number: String,
    pub date: NaiveDate,
    pub amount: Amount,
    /// Bank or cash account paying out
    pub paying_account_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectExpense {
    pub expense_id: Uuid,
    pub entity_id: Uuid,
    pub number: String,
    pub date: NaiveDate,
    pub paying_account_id: Uuid,
    pub items: Vec<ExpenseLine>,
}

/// Business event to be posted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PostingEvent {
    InvoiceIssued(InvoiceIssued),
    PaymentReceived(PaymentReceived),
    CashReceipt(CashReceipt),
    VendorBill(VendorBill),
    BillPayment(BillPayment),
    DirectExpense(DirectExpense),
}

impl PostingEvent {
    /// Document this event posts
    pub fn document(&self) -> DocumentRef {
        match self {
            PostingEvent::InvoiceIssued(e) => DocumentRef::new(DocumentKind::Invoice, e.invoice_id),
            PostingEvent::PaymentReceived(e) => {
                DocumentRef::new(DocumentKind::PaymentReceived, e.payment_id)
            }
            PostingEvent::CashReceipt(e) => DocumentRef::new(DocumentKind::Receipt, e.receipt_id),
            PostingEvent::VendorBill(e) => DocumentRef::new(DocumentKind::Bill, e.bill_id),
            PostingEvent::BillPayment(e) => {
                DocumentRef::new(DocumentKind::PaymentMade, e.payment_id)
            }
            PostingEvent::DirectExpense(e) => {
                DocumentRef::new(DocumentKind::Expense, e.expense_id)
            }
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            PostingEvent::InvoiceIssued(e) => e.entity_id,
            PostingEvent::PaymentReceived(e) => e.entity_id,
            PostingEvent::CashReceipt(e) => e.entity_id,
            PostingEvent::VendorBill(e) => e.entity_id,
            PostingEvent::BillPayment(e) => e.entity_id,
            PostingEvent::DirectExpense(e) => e.entity_id,
        }
    }

    /// Human document number
    pub fn number(&self) -> &str {
        match self {
            PostingEvent::InvoiceIssued(e) => &e.number,
            PostingEvent::PaymentReceived(e) => &e.number,
            PostingEvent::CashReceipt(e) => &e.number,
            PostingEvent::VendorBill(e) => &e.number,
            PostingEvent::BillPayment(e) => &e.number,
            PostingEvent::DirectExpense(e) => &e.number,
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            PostingEvent::InvoiceIssued(e) => e.date,
            PostingEvent::PaymentReceived(e) => e.date,
            PostingEvent::CashReceipt(e) => e.date,
            PostingEvent::VendorBill(e) => e.date,
            PostingEvent::BillPayment(e) => e.date,
            PostingEvent::DirectExpense(e) => e.date,
        }
    }

    /// Gross document total
    pub fn total(&self) -> Decimal {
        match self {
            PostingEvent::InvoiceIssued(e) => e.items.iter().map(|i| i.net + i.tax).sum(),
            PostingEvent::PaymentReceived(e) => e.amount.value(),
            PostingEvent::CashReceipt(e) => e.items.iter().map(|i| i.net + i.tax).sum(),
            PostingEvent::VendorBill(e) => e.items.iter().map(|i| i.net + i.tax).sum(),
            PostingEvent::BillPayment(e) => e.amount.value(),
            PostingEvent::DirectExpense(e) => e.items.iter().map(|i| i.net + i.tax).sum(),
        }
    }

    /// Document settled by this event and the amount it settles
    pub fn settles(&self) -> Option<(DocumentRef, Decimal)> {
        match self {
            PostingEvent::PaymentReceived(e) => Some((
                DocumentRef::new(DocumentKind::Invoice, e.invoice_id),
                e.amount.value(),
            )),
            PostingEvent::BillPayment(e) => Some((
                DocumentRef::new(DocumentKind::Bill, e.bill_id),
                e.amount.value(),
            )),
            _ => None,
        }
    }

    /// Journal description
    pub fn description(&self) -> String {
        match self {
            PostingEvent::InvoiceIssued(e) => format!("Invoice {}", e.number),
            PostingEvent::PaymentReceived(e) => format!("Payment received {}", e.number),
            PostingEvent::CashReceipt(e) => format!("Cash receipt {}", e.number),
            PostingEvent::VendorBill(e) => format!("Bill {}", e.number),
            PostingEvent::BillPayment(e) => format!("Bill payment {}", e.number),
            PostingEvent::DirectExpense(e) => format!("Expense {}", e.number),
        }
    }

    /// Amount sanity checks done before anything is queued
    pub fn validate_amounts(&self) -> Result<(), DomainError> {
        match self {
            PostingEvent::InvoiceIssued(e) => {
                require_items(e.items.len())?;
                for item in &e.items {
                    non_negative(item.net)?;
                    non_negative(item.tax)?;
                    non_negative(item.cost)?;
                }
            }
            PostingEvent::CashReceipt(e) => {
                require_items(e.items.len())?;
                for item in &e.items {
                    non_negative(item.net)?;
                    non_negative(item.tax)?;
                }
            }
            PostingEvent::VendorBill(VendorBill { items, .. })
            | PostingEvent::DirectExpense(DirectExpense { items, .. }) => {
                require_items(items.len())?;
                for item in items {
                    non_negative(item.net)?;
                    non_negative(item.tax)?;
                }
            }
            // Amount is validated on construction
            PostingEvent::PaymentReceived(_) | PostingEvent::BillPayment(_) => {}
        }

        if self.total() <= Decimal::ZERO {
            return Err(DomainError::InvalidAmount(format!(
                "{} total must be positive",
                self.document()
            )));
        }
        Ok(())
    }
}

fn require_items(count: usize) -> Result<(), DomainError> {
    if count == 0 {
        return Err(DomainError::InvalidAmount("document has no line items".to_string()));
    }
    Ok(())
}
