//! # Gubernator
//!
//! A horizontally sharded rate limiting service. Peers cooperate to enforce
//! per-key limits: every `(namespace, unique_key)` pair hashes to a single
//! owning peer which holds the authoritative counter, and batches of checks
//! are split, forwarded and reassembled in request order.
//!
//! ## Features
//!
//! - Token bucket and leaky bucket algorithms with burst capacity,
//!   negative (refund) hits and calendar-aligned windows
//! - Consistent-hash routing with atomic peer-set swaps
//! - Coalescing peer-to-peer batching over a binary framed RPC
//! - Eventually-consistent `GLOBAL` mode with owner broadcasts
//! - HTTP/JSON gateway and Prometheus metrics
//!
//! ## Architecture
//!
//! Each daemon wires five cooperating components: the [`store`] (bounded,
//! sharded counter cache), the [`algorithms`] (pure state machines), the
//! [`router`] (consistent-hash ring), the [`peer`] clients (batching RPC
//! forwarders) and the [`global`] subsystem (async hit forwarding plus
//! owner broadcasts). [`daemon::Daemon`] assembles them from a
//! [`config::DaemonConfig`] and tears them down in reverse on shutdown.

pub mod algorithms;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod error;
pub mod global;
pub mod http;
pub mod metrics;
pub mod peer;
pub mod router;
pub mod rpc;
pub mod service;
pub mod store;
pub mod types;

pub use clock::{Clock, FrozenClock, SystemClock};
pub use config::{ConfigLoader, DaemonConfig};
pub use daemon::Daemon;
pub use error::{ServiceError, ServiceResult};
pub use peer::PeerInfo;
pub use service::RateLimitService;
pub use types::{
    Algorithm, Behavior, GetRateLimitsReq, GetRateLimitsResp, HealthCheckResp, RateLimitReq,
    RateLimitResp, Status,
};
