//! SPV chain service: peer supervision, header synchronization, and
//! on-demand filter and block retrieval for a Bitcoin-like network.

pub mod addrbook;
pub mod ban;
pub mod config;
pub mod peer;
pub mod query;
pub mod service;
pub mod supervisor;
pub mod sync;
pub mod timesource;
pub mod wire;

pub use config::{Config, ConfigError, Tunables};
pub use peer::{NetTotals, PeerHandle, PeerId, PeerInfo};
pub use service::{ChainService, ServiceError};
pub use sync::SyncStatus;
