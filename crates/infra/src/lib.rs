//! Infrastructure layer: locks, queues, repositories, transports, config.

pub mod alerts;
pub mod auth_session;
pub mod cipher;
pub mod config;
pub mod lock;
pub mod queue;
pub mod store;
pub mod transport;

pub use config::{ConfigError, FleetConfig};
