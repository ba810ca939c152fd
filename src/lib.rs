//! Posting Engine Library
//!
//! Re-exports modules for integration testing and external use.

pub mod api;
pub mod chart;
pub mod domain;
pub mod ledger;
pub mod pipeline;
pub mod posting;
pub mod seeding;
pub mod store;

pub mod config;
pub mod db;
pub mod error;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use domain::{Amount, AmountError, DomainError, OperationContext};
pub use domain::{DocumentKind, DocumentRef, PostingStatus};
