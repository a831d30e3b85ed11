//! Browser-side tab tracker that streams its model to a companion switcher.

pub mod backoff;
pub mod bridge;
pub mod broadcast;
pub mod browser;
pub mod config;
pub mod dispatch;
pub mod identity;
pub mod logging;
pub mod runtime;
pub mod schedule;
pub mod socket;
pub mod tracker;
pub mod transport;

pub use browser::{BrowserApi, BrowserApiError, BrowserEvent, MemoryBrowser};
pub use config::AgentConfig;
pub use identity::{Identity, IdentityManager};
pub use runtime::Agent;
pub use tracker::{SnapshotSource, TabTracker};
pub use transport::{Transport, TransportAction, TransportConfig, TransportError, TransportState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Storage(#[from] tabmux_storage::StorageError),
    #[error(transparent)]
    Identity(#[from] identity::IdentityError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
