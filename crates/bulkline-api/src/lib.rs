//! Bulkline API - control surface over HTTP
//!
//! This crate exposes the campaign manager and the quota report as a small
//! REST API.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
