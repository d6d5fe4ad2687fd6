//! Peer identity as advertised to the cluster.

use serde::{Deserialize, Serialize};

/// Address and placement of one cluster member.
///
/// The RPC address doubles as the peer's identity: the consistent hash ring
/// is keyed by it and must therefore be stable for the life of the peer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerInfo {
    /// Address of the framed RPC listener, e.g. `127.0.0.1:1051`.
    pub grpc_address: String,
    /// Address of the HTTP gateway listener.
    pub http_address: String,
    /// Datacenter tag, empty when unset.
    pub data_center: String,
}

impl PeerInfo {
    /// Convenience constructor for the common two-address case.
    #[must_use]
    pub fn new(grpc_address: impl Into<String>, http_address: impl Into<String>) -> Self {
        Self {
            grpc_address: grpc_address.into(),
            http_address: http_address.into(),
            data_center: String::new(),
        }
    }
}
