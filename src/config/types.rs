//! Configuration type definitions.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::peer::PeerInfo;

/// Root configuration for one daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// Identity and listen addresses.
    pub daemon: DaemonSection,

    /// Counter cache sizing.
    pub cache: CacheConfig,

    /// Static peer discovery.
    pub peers: PeersConfig,

    /// Batching, forwarding and global-behavior tuning.
    pub behavior: BehaviorConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Daemon identity and binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Instance name used in logs.
    pub name: String,

    /// Bind address for the framed peer RPC listener.
    pub grpc_listen: SocketAddr,

    /// Bind address for the HTTP gateway and `/metrics`.
    pub http_listen: SocketAddr,

    /// Datacenter tag advertised to peers.
    pub data_center: String,

    /// RPC address advertised to peers. Defaults to the bound address,
    /// which also resolves a port-0 bind.
    pub advertise_grpc: Option<SocketAddr>,

    /// HTTP address advertised to peers. Defaults to the bound address.
    pub advertise_http: Option<SocketAddr>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            name: "gubernator".to_string(),
            grpc_listen: SocketAddr::from(([127, 0, 0, 1], 1051)),
            http_listen: SocketAddr::from(([127, 0, 0, 1], 1050)),
            data_center: String::new(),
            advertise_grpc: None,
            advertise_http: None,
        }
    }
}

/// Counter cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total counter capacity across all shards.
    pub capacity: usize,

    /// Number of mutex-guarded shards.
    pub shards: usize,

    /// Cadence of the expired-entry sweep in milliseconds.
    pub expiry_sweep_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            shards: 64,
            expiry_sweep_ms: 30_000,
        }
    }
}

/// Static peer list. External discovery can drive `Daemon::set_peers`
/// instead of, or in addition to, this list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PeersConfig {
    /// Every cluster member, including this daemon.
    pub static_members: Vec<PeerInfo>,
}

/// Batching, forwarding and global-behavior tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Coalescing window for forwarded requests, in microseconds.
    pub batch_window_us: u64,

    /// Maximum requests per forwarded RPC.
    pub batch_limit: usize,

    /// Bound on queued forwards per peer.
    pub batch_queue_depth: usize,

    /// Cadence of owner broadcasts, in milliseconds.
    pub global_broadcast_ms: u64,

    /// Bound on global hits awaiting forward.
    pub global_queue_depth: usize,

    /// Deadline for global forward and broadcast RPCs, in milliseconds.
    pub global_rpc_timeout_ms: u64,

    /// Default budget for calls arriving over RPC or HTTP, in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            batch_window_us: 500,
            batch_limit: 1_000,
            batch_queue_depth: 4_096,
            global_broadcast_ms: 100,
            global_queue_depth: 10_000,
            global_rpc_timeout_ms: 5_000,
            call_timeout_ms: 30_000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn or error.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
