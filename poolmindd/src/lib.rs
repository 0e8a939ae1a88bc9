//! Daemon for the pool-minder agent: keeps a live view of the pool
//! controller's equipment (bodies of water, heaters, pumps, circuits,
//! features, sensors) by combining push notifications with periodic
//! polling, and reports readings and change events.

pub mod classifier;
pub mod config;
pub mod event;
pub mod minder;
pub mod poller;
pub mod sink;
pub mod state;
pub mod sweep;
pub mod tracker;

use poolmind_broker::{ConnectionError, DiscoveryError};
use thiserror::Error;

pub use config::{Config, ConfigError};
pub use poller::HybridPoller;

#[derive(Error, Debug)]
pub enum PoolMinderError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Configuration Error")]
    Config(#[from] ConfigError),
    #[error("Connection Error")]
    Connection(#[from] ConnectionError),
    #[error("Discovery Error")]
    Discovery(#[from] DiscoveryError),
    #[error("Task Error")]
    Task(#[from] tokio::task::JoinError),
}

pub type PoolMinderResult<T> = std::result::Result<T, PoolMinderError>;
