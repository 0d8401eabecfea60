//! Campaign delivery

mod tracker;
mod worker;

pub use tracker::{InFlightGuard, InFlightTracker};
pub use worker::{DeliveryWorker, ProcessOutcome};
