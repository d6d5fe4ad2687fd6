//! Peer identity and outbound peer clients.

mod client;
mod info;

pub use client::{PeerClient, PeerClientConfig, PeerState, MIN_RPC_BUDGET};
pub use info::PeerInfo;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

/// The set of live peer clients, kept in sync with the peer set.
///
/// Clients for departed peers are dropped; their queue workers drain and
/// exit once the last in-flight forward completes.
#[derive(Debug)]
pub struct PeerPool {
    clients: RwLock<HashMap<String, Arc<PeerClient>>>,
    config: PeerClientConfig,
}

impl PeerPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(config: PeerClientConfig) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Reconcile the pool against the remote members of a new peer set.
    pub fn sync(&self, peers: &[PeerInfo]) {
        let mut clients = self.clients.write().expect("peer pool lock poisoned");

        clients.retain(|addr, _| {
            let keep = peers.iter().any(|p| p.grpc_address == *addr);
            if !keep {
                info!(peer = %addr, "dropping departed peer client");
            }
            keep
        });

        for peer in peers {
            if !clients.contains_key(&peer.grpc_address) {
                info!(peer = %peer.grpc_address, "adding peer client");
                clients.insert(
                    peer.grpc_address.clone(),
                    Arc::new(PeerClient::new(peer.clone(), self.config.clone())),
                );
            }
        }
    }

    /// The client for `addr`, if the peer is known.
    #[must_use]
    pub fn get(&self, addr: &str) -> Option<Arc<PeerClient>> {
        self.clients
            .read()
            .expect("peer pool lock poisoned")
            .get(addr)
            .cloned()
    }

    /// Every live peer client.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<PeerClient>> {
        self.clients
            .read()
            .expect("peer pool lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}
