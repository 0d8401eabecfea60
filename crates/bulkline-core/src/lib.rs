//! Bulkline Core - campaign scheduling and delivery
//!
//! This crate provides the delivery engine for Bulkline: recurrence
//! computation, the per-user quota gate, the delivery worker with its
//! messaging transport, and the scheduler that decides when campaigns run.

pub mod delivery;
pub mod quota;
pub mod recurrence;
pub mod scheduled;
pub mod transport;

pub use delivery::{DeliveryWorker, InFlightTracker, ProcessOutcome};
pub use quota::{QuotaGate, QuotaUsage};
pub use recurrence::RecurrenceError;
pub use scheduled::{CampaignError, CampaignManager, CreateCampaign, ProgressReport, Scheduler, TickReport};
pub use transport::{HttpTransport, MessagingTransport, SendReceipt, TransportError};
