//! Resilient notification transport for the campus attendance client.
//!
//! Live server pushes arrive over per-channel WebSocket connections that
//! reconnect with backoff and detect half-open sockets by heartbeat. User
//! actions taken while offline are recorded in a durable SQLite queue and
//! replayed over HTTP when connectivity returns. Documents and other
//! resources live in a byte-budgeted local cache.
//!
//! [`OfflineManager`] ties the pieces together for an application.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod network;
pub mod offline;
pub mod queue;
pub mod transport;

pub use config::Config;
pub use network::NetworkState;
pub use offline::OfflineManager;
