//! Scheduled delivery - campaign lifecycle and the scheduling loop

mod manager;
mod scheduler;

pub use manager::{CampaignError, CampaignManager, CreateCampaign, ProgressReport};
pub use scheduler::{Scheduler, TickReport};
