//! Posting service
//!
//! Enqueue side of the pipeline: validates a business event, registers its
//! document as Pending and queues the posting job in one store call.

use std::sync::Arc;

use crate::domain::{DocumentRecord, DocumentRef, DomainError, OperationContext, PostingStatus};
use crate::error::{AppError, AppResult};
use crate::posting::{
    check_settlement, BillPayment, CashReceipt, DirectExpense, InvoiceIssued, PaymentReceived,
    PostingEvent, VendorBill,
};
use crate::store::{DocumentStore, DocumentSubmission, JobQueue, Store};

use super::job::PostingJob;

/// Submits documents for posting and exposes their status
#[derive(Clone)]
pub struct PostingService {
    store: Arc<dyn Store>,
    max_attempts: u32,
}

impl PostingService {
    pub fn new(store: Arc<dyn Store>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    pub async fn submit_invoice(
        &self,
        ctx: &OperationContext,
        invoice: InvoiceIssued,
    ) -> AppResult<DocumentRecord> {
        self.submit(ctx, PostingEvent::InvoiceIssued(invoice)).await
    }

    pub async fn record_payment_received(
        &self,
        ctx: &OperationContext,
        payment: PaymentReceived,
    ) -> AppResult<DocumentRecord> {
        self.submit(ctx, PostingEvent::PaymentReceived(payment)).await
    }

    pub async fn record_cash_receipt(
        &self,
        ctx: &OperationContext,
        receipt: CashReceipt,
    ) -> AppResult<DocumentRecord> {
        self.submit(ctx, PostingEvent::CashReceipt(receipt)).await
    }

    pub async fn record_bill(
        &self,
        ctx: &OperationContext,
        bill: VendorBill,
    ) -> AppResult<DocumentRecord> {
        self.submit(ctx, PostingEvent::VendorBill(bill)).await
    }

    pub async fn record_bill_payment(
        &self,
        ctx: &OperationContext,
        payment: BillPayment,
    ) -> AppResult<DocumentRecord> {
        self.submit(ctx, PostingEvent::BillPayment(payment)).await
    }

    pub async fn record_direct_expense(
        &self,
        ctx: &OperationContext,
        expense: DirectExpense,
    ) -> AppResult<DocumentRecord> {
        self.submit(ctx, PostingEvent::DirectExpense(expense)).await
    }

    /// Validate, register Pending and enqueue.
    ///
    /// Overpayment is checked here for an early answer and again inside the
    /// store, where the settlement is applied atomically.
    pub async fn submit(
        &self,
        ctx: &OperationContext,
        event: PostingEvent,
    ) -> AppResult<DocumentRecord> {
        if event.entity_id() != ctx.entity_id {
            return Err(DomainError::BusinessRuleViolation(format!(
                "{} belongs to entity {}, not {}",
                event.document(),
                event.entity_id(),
                ctx.entity_id
            ))
            .into());
        }
        event.validate_amounts()?;

        let settles = event.settles();
        if let Some((target, amount)) = settles {
            let paid = self
                .store
                .get_document(target)
                .await?
                .filter(|doc| doc.entity_id == ctx.entity_id)
                .ok_or_else(|| DomainError::not_found(format!("document {}", target)))?;
            check_settlement(paid.total, paid.amount_settled, amount)?;
        }

        let document = event.document();
        let record = DocumentRecord::pending(document, ctx.entity_id, event.total());
        let job = PostingJob::for_event(&event, self.max_attempts)?;
        let job_id = job.id;

        self.store
            .submit_document(DocumentSubmission {
                record: record.clone(),
                settles,
                job,
            })
            .await?;

        tracing::info!(
            job_id = %job_id,
            document_id = %document.id,
            document_kind = %document.kind,
            entity_id = %ctx.entity_id,
            correlation_id = ?ctx.correlation_id,
            total = %record.total,
            "Document queued for posting"
        );
        Ok(record)
    }

    /// Manual retry: Failed -> Pending with a fresh job.
    ///
    /// Success is final; Pending and Processing documents are already on
    /// their way and are rejected as well.
    pub async fn retry_posting(&self, document: DocumentRef) -> AppResult<DocumentRecord> {
        let record = self.posting_status(document).await?;
        record.posting_status.transition(PostingStatus::Pending)?;

        let job = self.fresh_job(document).await?;
        let job_id = job.id;

        if !self.store.requeue_document(document, job).await? {
            // Lost against a concurrent retry or worker
            let current = self.posting_status(document).await?;
            return Err(DomainError::InvalidStatusTransition {
                from: current.posting_status,
                to: PostingStatus::Pending,
            }
            .into());
        }

        tracing::info!(
            job_id = %job_id,
            document_id = %document.id,
            document_kind = %document.kind,
            "Posting retry queued"
        );
        self.posting_status(document).await
    }

    /// Current posting state of a document
    pub async fn posting_status(&self, document: DocumentRef) -> AppResult<DocumentRecord> {
        self.store
            .get_document(document)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("document {}", document)).into())
    }

    async fn fresh_job(&self, document: DocumentRef) -> AppResult<PostingJob> {
        let previous = self.store.latest_job_for(document).await?.ok_or_else(|| {
            AppError::Internal(format!("no posting payload stored for {}", document))
        })?;
        Ok(PostingJob::for_event(&previous.event()?, self.max_attempts)?)
    }
}
