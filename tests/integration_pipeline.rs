//! Posting pipeline integration tests

use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

use posting_engine::domain::{AccountRole, DocumentKind, DocumentRef, DomainError, PostingStatus};
use posting_engine::pipeline::{JobOutcome, PostingJob, PostingWorker, WorkerConfig};
use posting_engine::posting::{
    BillPayment, CashReceipt, DirectExpense, ExpenseLine, ItemKind, PaymentReceived,
    PostingEvent, SaleLine, VendorBill,
};
use posting_engine::store::{ChartStore, JobQueue, LedgerStore, Store};
use posting_engine::{AppError, Amount, OperationContext};

mod common;
use common::{date, service_invoice, Fixture};

#[tokio::test]
async fn test_invoice_posting_e2e() {
    let fx = Fixture::seeded().await;
    let invoice = service_invoice(fx.ctx.entity_id, dec!(1000), dec!(100));
    let document = DocumentRef::new(DocumentKind::Invoice, invoice.invoice_id);

    let record = fx.posting.submit_invoice(&fx.ctx, invoice).await.unwrap();
    assert_eq!(record.posting_status, PostingStatus::Pending);
    assert_eq!(record.total, dec!(1100));

    let outcomes = fx.worker().run_until_idle().await.unwrap();
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Posted { .. }]));

    let record = fx.posting.posting_status(document).await.unwrap();
    assert_eq!(record.posting_status, PostingStatus::Success);
    assert_eq!(record.attempts, 1);
    assert!(record.journal_reference.as_deref().unwrap().starts_with("JV-"));
    assert!(record.error_code.is_none());

    assert_eq!(fx.balance(fx.account(AccountRole::AccountsReceivable)).await, dec!(1100));
    assert_eq!(fx.balance(fx.account(AccountRole::ServiceRevenue)).await, dec!(1000));
    assert_eq!(fx.balance(fx.account(AccountRole::TaxPayable)).await, dec!(100));

    let journal = fx
        .ledger
        .journal(&fx.ctx, record.journal_id.unwrap())
        .await
        .unwrap();
    assert_eq!(journal.source, document);
    assert_eq!(journal.lines.len(), 3);

    let trial = fx.ledger.trial_balance(fx.ctx.entity_id).await.unwrap();
    assert!(trial.is_balanced());
    assert_eq!(trial.total_debit, dec!(1100));
}

#[tokio::test]
async fn test_redelivered_job_does_not_post_twice() {
    let fx = Fixture::seeded().await;
    let invoice = service_invoice(fx.ctx.entity_id, dec!(200), dec!(0));
    let event = PostingEvent::InvoiceIssued(invoice.clone());
    fx.posting.submit_invoice(&fx.ctx, invoice).await.unwrap();

    let worker = fx.worker();
    worker.run_until_idle().await.unwrap();

    // Same event delivered again
    fx.store
        .enqueue(&PostingJob::for_event(&event, 3).unwrap())
        .await
        .unwrap();
    let outcomes = worker.run_until_idle().await.unwrap();
    assert_eq!(outcomes, vec![JobOutcome::AlreadyPosted]);

    assert_eq!(fx.store.count_journals(fx.ctx.entity_id).await.unwrap(), 1);
    assert_eq!(fx.balance(fx.account(AccountRole::AccountsReceivable)).await, dec!(200));

    // Resubmitting the document itself is a conflict
    let resubmit = fx
        .posting
        .submit(&fx.ctx, event)
        .await;
    assert!(matches!(resubmit, Err(AppError::Domain(DomainError::Conflict(_)))));
}

#[tokio::test]
async fn test_transient_commit_failure_is_retried() {
    let fx = Fixture::seeded().await;
    let invoice = service_invoice(fx.ctx.entity_id, dec!(300), dec!(30));
    let document = DocumentRef::new(DocumentKind::Invoice, invoice.invoice_id);
    fx.posting.submit_invoice(&fx.ctx, invoice).await.unwrap();

    fx.store.fail_next_commits(1);
    let outcomes = fx.worker().run_until_idle().await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        outcomes[0],
        JobOutcome::Retrying {
            error_code: "store_unavailable".into()
        }
    );
    assert!(matches!(outcomes[1], JobOutcome::Posted { .. }));

    let record = fx.posting.posting_status(document).await.unwrap();
    assert_eq!(record.posting_status, PostingStatus::Success);
    assert_eq!(record.attempts, 2);
    assert!(record.error_code.is_none());
    assert_eq!(fx.balance(fx.account(AccountRole::AccountsReceivable)).await, dec!(330));
}

#[tokio::test]
async fn test_missing_configuration_fails_document() {
    let fx = Fixture::seeded().await;

    // Entity in the same group without any role bindings
    let bare = OperationContext::new(fx.ctx.group_id, Uuid::new_v4());
    let invoice = service_invoice(bare.entity_id, dec!(100), dec!(0));
    let document = DocumentRef::new(DocumentKind::Invoice, invoice.invoice_id);
    fx.posting.submit_invoice(&bare, invoice).await.unwrap();

    let outcomes = fx.worker().run_until_idle().await.unwrap();
    assert_eq!(
        outcomes,
        vec![JobOutcome::Failed {
            error_code: "missing_account_configuration".into()
        }]
    );

    let record = fx.posting.posting_status(document).await.unwrap();
    assert_eq!(record.posting_status, PostingStatus::Failed);
    assert_eq!(record.error_code.as_deref(), Some("missing_account_configuration"));
    assert!(record.journal_id.is_none());
    assert_eq!(fx.store.count_journals(bare.entity_id).await.unwrap(), 0);

    // Fix the chart, then retry by hand
    fx.chart
        .seed_default_chart(&bare)
        .await
        .unwrap();
    let retried = fx.posting.retry_posting(document).await.unwrap();
    assert_eq!(retried.posting_status, PostingStatus::Pending);

    fx.worker().run_until_idle().await.unwrap();
    let record = fx.posting.posting_status(document).await.unwrap();
    assert_eq!(record.posting_status, PostingStatus::Success);
}

#[tokio::test]
async fn test_overpayment_is_rejected() {
    let fx = Fixture::seeded().await;
    let cash = fx.chart.create_bank_account(&fx.ctx, "Main Bank").await.unwrap();
    let invoice = service_invoice(fx.ctx.entity_id, dec!(1000), dec!(100));
    let invoice_id = invoice.invoice_id;
    fx.posting.submit_invoice(&fx.ctx, invoice).await.unwrap();

    let payment = |amount: i64| PaymentReceived {
        payment_id: Uuid::new_v4(),
        entity_id: fx.ctx.entity_id,
        invoice_id,
        number: "PR-1".into(),
        date: date(),
        amount: Amount::from_integer(amount).unwrap(),
        deposit_account_id: cash.id,
    };

    fx.posting
        .record_payment_received(&fx.ctx, payment(1000))
        .await
        .unwrap();
    let over = fx
        .posting
        .record_payment_received(&fx.ctx, payment(200))
        .await;
    assert!(matches!(
        over,
        Err(AppError::Domain(DomainError::Overpayment { .. }))
    ));

    fx.worker().run_until_idle().await.unwrap();

    let invoice = fx
        .posting
        .posting_status(DocumentRef::new(DocumentKind::Invoice, invoice_id))
        .await
        .unwrap();
    assert_eq!(invoice.amount_settled, dec!(1000));
    assert_eq!(fx.balance(fx.account(AccountRole::AccountsReceivable)).await, dec!(100));
    assert_eq!(fx.balance(cash.id).await, dec!(1000));
}

#[tokio::test]
async fn test_bill_and_payment() {
    let fx = Fixture::seeded().await;
    let cash = fx
        .store
        .find_account_by_code(fx.ctx.entity_id, "1110-01")
        .await
        .unwrap()
        .unwrap();
    let expense = fx
        .store
        .find_account_by_code(fx.ctx.entity_id, "5210-01")
        .await
        .unwrap()
        .unwrap();

    let bill_id = Uuid::new_v4();
    fx.posting
        .record_bill(
            &fx.ctx,
            VendorBill {
                bill_id,
                entity_id: fx.ctx.entity_id,
                number: "BILL-1".into(),
                date: date(),
                items: vec![ExpenseLine {
                    expense_account_id: expense.id,
                    net: dec!(1500),
                    tax: dec!(0),
                }],
            },
        )
        .await
        .unwrap();
    fx.worker().run_until_idle().await.unwrap();

    let payable = fx.account(AccountRole::AccountsPayable);
    assert_eq!(fx.balance(payable).await, dec!(1500));
    assert_eq!(fx.balance(expense.id).await, dec!(1500));

    fx.posting
        .record_bill_payment(
            &fx.ctx,
            BillPayment {
                payment_id: Uuid::new_v4(),
                entity_id: fx.ctx.entity_id,
                bill_id,
                number: "PM-1".into(),
                date: date(),
                amount: Amount::from_integer(500).unwrap(),
                paying_account_id: cash.id,
            },
        )
        .await
        .unwrap();
    fx.worker().run_until_idle().await.unwrap();

    assert_eq!(fx.balance(payable).await, dec!(1000));
    assert_eq!(fx.balance(cash.id).await, dec!(-500));

    let trial = fx.ledger.trial_balance(fx.ctx.entity_id).await.unwrap();
    assert!(trial.is_balanced());
}

#[tokio::test]
async fn test_cash_receipt_and_direct_expense() {
    let fx = Fixture::seeded().await;
    let till = fx.chart.create_bank_account(&fx.ctx, "Till").await.unwrap();
    let expense = fx
        .store
        .find_account_by_code(fx.ctx.entity_id, "5210-01")
        .await
        .unwrap()
        .unwrap();

    fx.posting
        .record_cash_receipt(
            &fx.ctx,
            CashReceipt {
                receipt_id: Uuid::new_v4(),
                entity_id: fx.ctx.entity_id,
                number: "RC-1".into(),
                date: date(),
                deposit_account_id: till.id,
                items: vec![SaleLine {
                    kind: ItemKind::Product,
                    net: dec!(200),
                    tax: dec!(20),
                }],
            },
        )
        .await
        .unwrap();
    fx.posting
        .record_direct_expense(
            &fx.ctx,
            DirectExpense {
                expense_id: Uuid::new_v4(),
                entity_id: fx.ctx.entity_id,
                number: "EX-1".into(),
                date: date(),
                paying_account_id: till.id,
                items: vec![ExpenseLine {
                    expense_account_id: expense.id,
                    net: dec!(80),
                    tax: dec!(8),
                }],
            },
        )
        .await
        .unwrap();

    let outcomes = fx.worker().run_until_idle().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| matches!(o, JobOutcome::Posted { .. })));

    assert_eq!(fx.balance(till.id).await, dec!(132));
    assert_eq!(fx.balance(fx.account(AccountRole::ProductRevenue)).await, dec!(200));
    // Output tax 20 less input tax 8
    assert_eq!(fx.balance(fx.account(AccountRole::TaxPayable)).await, dec!(12));
    assert_eq!(fx.balance(expense.id).await, dec!(80));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_post_each_document_once() {
    let fx = Fixture::seeded().await;
    let mut documents = Vec::new();
    for _ in 0..20 {
        let invoice = service_invoice(fx.ctx.entity_id, dec!(100), dec!(10));
        documents.push(DocumentRef::new(DocumentKind::Invoice, invoice.invoice_id));
        fx.posting.submit_invoice(&fx.ctx, invoice).await.unwrap();
    }

    let store: Arc<dyn Store> = fx.shared_store();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let worker = PostingWorker::new(store.clone(), WorkerConfig::default());
            tokio::spawn(async move { worker.run_until_idle().await })
        })
        .collect();

    let mut posted = 0;
    for handle in handles {
        let outcomes = handle.await.unwrap().unwrap();
        posted += outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Posted { .. }))
            .count();
    }
    assert_eq!(posted, 20);

    for document in documents {
        let record = fx.posting.posting_status(document).await.unwrap();
        assert_eq!(record.posting_status, PostingStatus::Success);
    }
    assert_eq!(fx.store.count_journals(fx.ctx.entity_id).await.unwrap(), 20);

    let receivable = fx.account(AccountRole::AccountsReceivable);
    let check = fx
        .ledger
        .verify_account_balance(&fx.ctx, receivable)
        .await
        .unwrap();
    assert!(check.consistent);
    assert_eq!(check.stored, dec!(2200));

    let (debit, credit) = fx.store.balance_totals(fx.ctx.entity_id).unwrap();
    assert_eq!(debit, credit);
}
