//! Network layer for Mongotape
//!
//! Opens live connections to the replay target with bounded concurrency.

mod auth;
mod connection;
mod connector;
mod lane_pool;

pub use auth::{authenticate, Credentials, SCRAM_SHA_256};
pub use connection::WireConnection;
pub use connector::{Connector, TcpConnector};
pub use lane_pool::{LaneGuard, LanePool};

/// Default maximum number of lanes holding a live connection
pub const MAX_LANES: usize = 64;

/// Connection setup timeout
pub const CONNECT_TIMEOUT_MS: u64 = 1000;
