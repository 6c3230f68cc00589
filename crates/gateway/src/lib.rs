//! Gateway core: channel account lifecycle, outbound delivery, capability
//! dispatch and the HTTP health surface.
//!
//! Lifecycle:
//! 1. Build a [`ChannelRegistry`](switchboard_channels::ChannelRegistry) and load config
//! 2. [`ChannelManager::refresh`] derives every account's idle state
//! 3. [`ChannelManager::start_all`] connects runnable accounts
//! 4. [`server::serve`] exposes `/health` and `/channels`
//! 5. [`ChannelManager::stop_all`] on shutdown

pub mod accounts;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod log_channel;
pub mod server;

pub use {
    accounts::{AccountEvent, AccountKey, ChannelManager},
    delivery::{DeliveryPipeline, DeliveryReport, DeliveryStatus, DeliveryTarget},
    error::{Error, Result},
    health::{HealthReport, health_report},
};
