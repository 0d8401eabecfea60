//! Bulkline Common - Shared types and utilities
//!
//! Configuration, the top-level error type and identifier aliases shared by
//! every Bulkline crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
