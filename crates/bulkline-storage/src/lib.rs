//! Bulkline Storage - Campaign store abstraction
//!
//! This crate defines the persisted campaign model and the store traits the
//! delivery engine depends on, with a PostgreSQL backend for production and
//! an in-memory backend for tests and local runs.

pub mod db;
pub mod models;
pub mod quota;
pub mod store;

pub use db::DatabasePool;
pub use models::*;
pub use quota::{QuotaDecision, QUOTA_EXCEEDED_REASON};
pub use store::{CampaignStore, MemoryStore, PgStore, QuotaStore, StoreError, StoreResult};
