//! Delivery core of the forum platform: encrypted direct messages, background
//! notification jobs, real-time event fan-out and call signaling.

pub mod broker;
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod routes;
pub mod services;
pub mod signaling;
pub mod state;

pub use broker::{ConnectionDropped, EventBroker, EventFrame, Subscription};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use jobs::{DeliveryJob, DeliveryJobHandler, LoggingNotifier, Notifier, NotifyError};
pub use services::{DeliveryRoute, DeliveryService};
pub use signaling::{RelayChannel, RelayError, SendOutcome, SignalingMessage, SignalingRelay};
pub use state::AppState;
