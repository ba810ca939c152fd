//! API Routes
//!
//! Operational endpoints: posting status polling, manual retry, trial
//! balance and queue counters.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{DocumentKind, DocumentRecord, DocumentRef, PostingStatus};
use crate::error::AppError;
use crate::ledger::TrialBalance;
use crate::pipeline::JobStats;

use super::AppState;

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Serialize)]
pub struct PostingStatusResponse {
    pub document_kind: DocumentKind,
    pub document_id: Uuid,
    pub posting_status: PostingStatus,
    pub journal_id: Option<Uuid>,
    pub journal_reference: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub updated_at: DateTime<Utc>,
}

impl From<DocumentRecord> for PostingStatusResponse {
    fn from(record: DocumentRecord) -> Self {
        Self {
            document_kind: record.reference.kind,
            document_id: record.reference.id,
            posting_status: record.posting_status,
            journal_id: record.journal_id,
            journal_reference: record.journal_reference,
            posted_at: record.posted_at,
            error_code: record.error_code,
            error_message: record.error_message,
            attempts: record.attempts,
            updated_at: record.updated_at,
        }
    }
}

/// Create the API router
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/documents/:kind/:id/posting", get(get_posting_status))
        .route("/documents/:kind/:id/retry", post(retry_posting))
        .route("/entities/:entity_id/trial-balance", get(get_trial_balance))
        .route("/jobs/stats", get(get_job_stats))
}

fn document_ref(kind: &str, id: Uuid) -> Result<DocumentRef, AppError> {
    let kind = kind
        .parse::<DocumentKind>()
        .map_err(|_| AppError::InvalidRequest(format!("Unknown document kind '{}'", kind)))?;
    Ok(DocumentRef::new(kind, id))
}

// =========================================================================
// GET /documents/:kind/:id/posting
// =========================================================================

async fn get_posting_status(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> Result<Json<PostingStatusResponse>, AppError> {
    let document = document_ref(&kind, id)?;
    let record = state.posting.posting_status(document).await?;
    Ok(Json(record.into()))
}

// =========================================================================
// POST /documents/:kind/:id/retry
// =========================================================================

async fn retry_posting(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> Result<(StatusCode, Json<PostingStatusResponse>), AppError> {
    let document = document_ref(&kind, id)?;
    let record = state.posting.retry_posting(document).await?;
    Ok((StatusCode::ACCEPTED, Json(record.into())))
}

// =========================================================================
// GET /entities/:entity_id/trial-balance
// =========================================================================

async fn get_trial_balance(
    State(state): State<AppState>,
    Path(entity_id): Path<Uuid>,
) -> Result<Json<TrialBalance>, AppError> {
    Ok(Json(state.ledger.trial_balance(entity_id).await?))
}

// =========================================================================
// GET /jobs/stats
// =========================================================================

async fn get_job_stats(State(state): State<AppState>) -> Result<Json<JobStats>, AppError> {
    Ok(Json(state.store.stats().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_ref_parsing() {
        let id = Uuid::new_v4();
        let document = document_ref("payment_made", id).unwrap();
        assert_eq!(document.kind, DocumentKind::PaymentMade);
        assert_eq!(document.id, id);

        assert!(matches!(
            document_ref("quote", id),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_posting_status_response_serialization() {
        let record = DocumentRecord::pending(
            DocumentRef::new(DocumentKind::Invoice, Uuid::new_v4()),
            Uuid::new_v4(),
            rust_decimal::Decimal::ONE_HUNDRED,
        );
        let json = serde_json::to_value(PostingStatusResponse::from(record)).unwrap();
        assert_eq!(json["document_kind"], "invoice");
        assert_eq!(json["posting_status"], "pending");
        assert!(json["journal_reference"].is_null());
    }
}
