//! Common test utilities

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use posting_engine::chart::ChartService;
use posting_engine::domain::{AccountRole, ChartRoleBindings, OperationContext};
use posting_engine::ledger::LedgerQueryService;
use posting_engine::pipeline::{PostingService, PostingWorker, RetryPolicy, WorkerConfig};
use posting_engine::posting::{InvoiceIssued, InvoiceItem, ItemKind};
use posting_engine::store::{InMemoryStore, Store};

/// One entity with the default chart seeded and every role bound
pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub ctx: OperationContext,
    pub bindings: ChartRoleBindings,
    pub chart: ChartService,
    pub posting: PostingService,
    pub ledger: LedgerQueryService,
}

impl Fixture {
    pub async fn seeded() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let ctx = OperationContext::new(Uuid::new_v4(), Uuid::new_v4());
        let shared: Arc<dyn Store> = store.clone();

        let chart = ChartService::new(shared.clone());
        let bindings = chart
            .seed_default_chart(&ctx)
            .await
            .expect("Failed to seed chart");

        Self {
            posting: PostingService::new(shared.clone(), 3),
            ledger: LedgerQueryService::new(shared),
            store,
            ctx,
            bindings,
            chart,
        }
    }

    pub fn shared_store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Worker whose retries are due immediately
    pub fn worker(&self) -> PostingWorker {
        PostingWorker::new(
            self.shared_store(),
            WorkerConfig {
                retry: RetryPolicy::fixed(3, std::time::Duration::ZERO),
                ..WorkerConfig::default()
            },
        )
    }

    pub fn account(&self, role: AccountRole) -> Uuid {
        self.bindings
            .require(role)
            .expect("Role not bound")
            .account_id
    }

    pub async fn balance(&self, account_id: Uuid) -> Decimal {
        self.ledger
            .account_balance(&self.ctx, account_id)
            .await
            .expect("Failed to read balance")
            .balance
    }
}

pub fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 15).expect("valid date")
}

/// Service invoice: one line with the given net and tax
pub fn service_invoice(entity_id: Uuid, net: Decimal, tax: Decimal) -> InvoiceIssued {
    InvoiceIssued {
        invoice_id: Uuid::new_v4(),
        entity_id,
        number: format!("INV-{}", &Uuid::new_v4().simple().to_string()[..6]),
        date: date(),
        items: vec![InvoiceItem {
            kind: ItemKind::Service,
            net,
            tax,
            track_inventory: false,
            cost: Decimal::ZERO,
        }],
    }
}
