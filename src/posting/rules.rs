//! Posting rules
//!
//! Pure functions turning a business event into balanced journal lines.
//! Well-known accounts come from the entity's `ChartRoleBindings`; accounts
//! chosen per document (bank, expense) come from the event itself.

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{AccountRole, ChartRoleBindings, DomainError, JournalDraft, JournalLine};

use super::events::{
    BillPayment, CashReceipt, DirectExpense, ExpenseLine, InvoiceIssued, ItemKind,
    PaymentReceived, PostingEvent, SaleLine, VendorBill,
};

/// Accumulates lines, merging repeated (account, side) pairs and dropping
/// zero amounts.
#[derive(Default)]
struct LineSet {
    entries: Vec<(Uuid, bool, Decimal, &'static str)>,
}

impl LineSet {
    fn debit(&mut self, account_id: Uuid, amount: Decimal, memo: &'static str) -> &mut Self {
        self.push(account_id, true, amount, memo)
    }

    fn credit(&mut self, account_id: Uuid, amount: Decimal, memo: &'static str) -> &mut Self {
        self.push(account_id, false, amount, memo)
    }

    fn push(&mut self, account_id: Uuid, is_debit: bool, amount: Decimal, memo: &'static str) -> &mut Self {
        if amount.is_zero() {
            return self;
        }
        match self
            .entries
            .iter_mut()
            .find(|(id, side, _, _)| *id == account_id && *side == is_debit)
        {
            Some(entry) => entry.2 += amount,
            None => self.entries.push((account_id, is_debit, amount, memo)),
        }
        self
    }

    fn finish(self) -> Result<JournalDraft, DomainError> {
        let lines = self
            .entries
            .into_iter()
            .map(|(account_id, is_debit, amount, memo)| {
                let line = if is_debit {
                    JournalLine::debit(account_id, amount)?
                } else {
                    JournalLine::credit(account_id, amount)?
                };
                Ok(line.with_memo(memo))
            })
            .collect::<Result<Vec<_>, DomainError>>()?;
        JournalDraft::from_lines(lines)
    }
}

/// Role account, only required when the amount is non-zero
fn role_account(
    bindings: &ChartRoleBindings,
    role: AccountRole,
    amount: Decimal,
) -> Result<Option<Uuid>, DomainError> {
    if amount.is_zero() {
        return Ok(None);
    }
    Ok(Some(bindings.require(role)?.account_id))
}

struct SalesSplit {
    product_net: Decimal,
    service_net: Decimal,
    tax: Decimal,
}

impl SalesSplit {
    fn total(&self) -> Decimal {
        self.product_net + self.service_net + self.tax
    }
}

fn split_sales<'a>(lines: impl Iterator<Item = (ItemKind, Decimal, Decimal)> + 'a) -> SalesSplit {
    let mut split = SalesSplit {
        product_net: Decimal::ZERO,
        service_net: Decimal::ZERO,
        tax: Decimal::ZERO,
    };
    for (kind, net, tax) in lines {
        match kind {
            ItemKind::Product => split.product_net += net,
            ItemKind::Service => split.service_net += net,
        }
        split.tax += tax;
    }
    split
}

/// Credit revenue by sub-type and tax payable
fn credit_sales(
    lines: &mut LineSet,
    bindings: &ChartRoleBindings,
    split: &SalesSplit,
) -> Result<(), DomainError> {
    if let Some(account) = role_account(bindings, AccountRole::ProductRevenue, split.product_net)? {
        lines.credit(account, split.product_net, "Product revenue");
    }
    if let Some(account) = role_account(bindings, AccountRole::ServiceRevenue, split.service_net)? {
        lines.credit(account, split.service_net, "Service revenue");
    }
    if let Some(account) = role_account(bindings, AccountRole::TaxPayable, split.tax)? {
        lines.credit(account, split.tax, "Output tax");
    }
    Ok(())
}

/// Debit expenses per account and input tax
fn debit_expenses(
    lines: &mut LineSet,
    bindings: &ChartRoleBindings,
    items: &[ExpenseLine],
) -> Result<Decimal, DomainError> {
    let mut tax = Decimal::ZERO;
    for item in items {
        lines.debit(item.expense_account_id, item.net, "Expense");
        tax += item.tax;
    }
    if let Some(account) = role_account(bindings, AccountRole::TaxPayable, tax)? {
        lines.debit(account, tax, "Input tax");
    }
    Ok(items.iter().map(|i| i.net).sum::<Decimal>() + tax)
}

// =========================================================================
// Rules
// =========================================================================

/// Invoice issued: AR debit; revenue and tax credits; COGS/Inventory pair
/// for tracked-inventory product items.
pub fn invoice_issued(
    bindings: &ChartRoleBindings,
    event: &InvoiceIssued,
) -> Result<JournalDraft, DomainError> {
    let split = split_sales(event.items.iter().map(|i| (i.kind, i.net, i.tax)));
    let cost: Decimal = event.items.iter().map(|i| i.inventory_cost()).sum();

    let receivable = bindings.require(AccountRole::AccountsReceivable)?.account_id;

    let mut lines = LineSet::default();
    lines.debit(receivable, split.total(), "Accounts receivable");
    credit_sales(&mut lines, bindings, &split)?;

    if !cost.is_zero() {
        let cogs = bindings.require(AccountRole::CostOfGoodsSold)?.account_id;
        let inventory = bindings.require(AccountRole::Inventory)?.account_id;
        lines.debit(cogs, cost, "Cost of goods sold");
        lines.credit(inventory, cost, "Inventory issued");
    }

    lines.finish()
}

/// Payment received against an invoice: bank debit, AR credit.
pub fn payment_received(
    bindings: &ChartRoleBindings,
    event: &PaymentReceived,
) -> Result<JournalDraft, DomainError> {
    let receivable = bindings.require(AccountRole::AccountsReceivable)?.account_id;
    let amount = event.amount.value();

    let mut lines = LineSet::default();
    lines
        .debit(event.deposit_account_id, amount, "Deposit")
        .credit(receivable, amount, "Accounts receivable");
    lines.finish()
}

/// Cash receipt without invoice: bank debit; revenue and tax credits.
pub fn cash_receipt(
    bindings: &ChartRoleBindings,
    event: &CashReceipt,
) -> Result<JournalDraft, DomainError> {
    let split = split_sales(
        event
            .items
            .iter()
            .map(|SaleLine { kind, net, tax }| (*kind, *net, *tax)),
    );

    let mut lines = LineSet::default();
    lines.debit(event.deposit_account_id, split.total(), "Deposit");
    credit_sales(&mut lines, bindings, &split)?;
    lines.finish()
}

/// Vendor bill: expense and input tax debits, AP credit.
pub fn vendor_bill(
    bindings: &ChartRoleBindings,
    event: &VendorBill,
) -> Result<JournalDraft, DomainError> {
    let payable = bindings.require(AccountRole::AccountsPayable)?.account_id;

    let mut lines = LineSet::default();
    let total = debit_expenses(&mut lines, bindings, &event.items)?;
    lines.credit(payable, total, "Accounts payable");
    lines.finish()
}

/// Bill payment: AP debit, bank credit.
pub fn bill_payment(
    bindings: &ChartRoleBindings,
    event: &BillPayment,
) -> Result<JournalDraft, DomainError> {
    let payable = bindings.require(AccountRole::AccountsPayable)?.account_id;
    let amount = event.amount.value();

    let mut lines = LineSet::default();
    lines
        .debit(payable, amount, "Accounts payable")
        .credit(event.paying_account_id, amount, "Payment");
    lines.finish()
}

/// Direct expense without bill: expense and input tax debits, bank credit.
pub fn direct_expense(
    bindings: &ChartRoleBindings,
    event: &DirectExpense,
) -> Result<JournalDraft, DomainError> {
    let mut lines = LineSet::default();
    let total = debit_expenses(&mut lines, bindings, &event.items)?;
    lines.credit(event.paying_account_id, total, "Payment");
    lines.finish()
}

/// Build the journal for any posting event
pub fn build_journal(
    event: &PostingEvent,
    bindings: &ChartRoleBindings,
) -> Result<JournalDraft, DomainError> {
    if bindings.entity_id != event.entity_id() {
        return Err(DomainError::BusinessRuleViolation(format!(
            "role bindings of entity {} cannot post {} for entity {}",
            bindings.entity_id,
            event.document(),
            event.entity_id()
        )));
    }

    match event {
        PostingEvent::InvoiceIssued(e) => invoice_issued(bindings, e),
        PostingEvent::PaymentReceived(e) => payment_received(bindings, e),
        PostingEvent::CashReceipt(e) => cash_receipt(bindings, e),
        PostingEvent::VendorBill(e) => vendor_bill(bindings, e),
        PostingEvent::BillPayment(e) => bill_payment(bindings, e),
        PostingEvent::DirectExpense(e) => direct_expense(bindings, e),
    }
}

/// Reject a payment that would settle more than the document's total.
pub fn check_settlement(
    total: Decimal,
    settled: Decimal,
    amount: Decimal,
) -> Result<(), DomainError> {
    if amount <= Decimal::ZERO {
        return Err(DomainError::InvalidAmount(format!(
            "payment must be positive (got {})",
            amount
        )));
    }
    if settled + amount > total {
        return Err(DomainError::Overpayment {
            total,
            settled,
            amount,
        });
    }
    Ok(())
}
