//! Request routing over a consistent-hash ring.
//!
//! The ring is keyed by peer RPC address with a fixed number of virtual
//! nodes per peer. Peer-set changes publish a whole new snapshot through an
//! [`ArcSwap`]; readers that already loaded a snapshot finish their batch
//! against it, so a membership change never tears a batch in half.
//!
//! The hash is FNV-1a (64-bit). It is part of the wire contract between
//! peers: changing it redistributes every key, so it must stay fixed across
//! releases.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::peer::PeerInfo;
use crate::types::RateLimitReq;

/// Virtual nodes placed on the ring per peer.
const VNODES_PER_PEER: usize = 512;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable 64-bit FNV-1a hash.
#[must_use]
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Who evaluates a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// This peer holds the authoritative counter.
    Local,
    /// Another peer owns the key.
    Remote(PeerInfo),
}

/// An immutable view of the peer set and its hash ring.
#[derive(Debug)]
pub struct RingSnapshot {
    peers: Vec<PeerInfo>,
    /// `(hash, index into peers)`, sorted by hash.
    ring: Vec<(u64, u32)>,
    self_address: String,
}

impl RingSnapshot {
    fn build(self_address: String, peers: Vec<PeerInfo>) -> Self {
        let mut ring = Vec::with_capacity(peers.len() * VNODES_PER_PEER);
        for (idx, peer) in peers.iter().enumerate() {
            for vnode in 0..VNODES_PER_PEER {
                let point = format!("{}/{vnode}", peer.grpc_address);
                ring.push((fnv1a64(point.as_bytes()), idx as u32));
            }
        }
        ring.sort_unstable();
        Self {
            peers,
            ring,
            self_address,
        }
    }

    /// The peer owning `(name, unique_key)`.
    ///
    /// An empty peer set means single-node operation: everything is local.
    #[must_use]
    pub fn owner_of(&self, name: &str, unique_key: &str) -> Owner {
        if self.ring.is_empty() {
            return Owner::Local;
        }

        let key = format!("{name}_{unique_key}");
        let hash = fnv1a64(key.as_bytes());
        let at = self.ring.partition_point(|&(h, _)| h < hash);
        let (_, idx) = self.ring[at % self.ring.len()];
        let peer = &self.peers[idx as usize];

        if peer.grpc_address == self.self_address {
            Owner::Local
        } else {
            Owner::Remote(peer.clone())
        }
    }

    /// Group a batch by owner, preserving each request's original index so
    /// the joined responses can be laid back down in request order.
    #[must_use]
    pub fn split_batch(&self, requests: &[RateLimitReq]) -> BatchPlan {
        let mut plan = BatchPlan::default();
        for (idx, req) in requests.iter().enumerate() {
            match self.owner_of(&req.name, &req.unique_key) {
                Owner::Local => plan.local.push(idx),
                Owner::Remote(peer) => {
                    plan.remote
                        .entry(peer.grpc_address.clone())
                        .or_insert_with(|| (peer, Vec::new()))
                        .1
                        .push(idx);
                }
            }
        }
        plan
    }

    /// All peers in this snapshot, including self.
    #[must_use]
    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    /// Peers in this snapshot other than self.
    pub fn remote_peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers
            .iter()
            .filter(move |p| p.grpc_address != self.self_address)
    }

    /// Number of peers in the snapshot.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

/// A batch grouped by owner; indices refer to the original request slice.
#[derive(Debug, Default)]
pub struct BatchPlan {
    /// Indices evaluated on this peer.
    pub local: Vec<usize>,
    /// Indices forwarded to each remote peer, keyed by RPC address.
    pub remote: HashMap<String, (PeerInfo, Vec<usize>)>,
}

/// Routes requests to their owning peer using read-copy-update snapshots.
#[derive(Debug)]
pub struct Router {
    snapshot: ArcSwap<RingSnapshot>,
    self_address: String,
}

impl Router {
    /// Create a router for the peer advertising `self_address`, with an
    /// empty (single-node) peer set.
    #[must_use]
    pub fn new(self_address: impl Into<String>) -> Self {
        let self_address = self_address.into();
        Self {
            snapshot: ArcSwap::from_pointee(RingSnapshot::build(self_address.clone(), Vec::new())),
            self_address,
        }
    }

    /// Atomically publish a new peer set. In-flight batches keep the
    /// snapshot they loaded.
    pub fn set_peers(&self, peers: Vec<PeerInfo>) {
        let next = RingSnapshot::build(self.self_address.clone(), peers);
        self.snapshot.store(Arc::new(next));
    }

    /// The current ring snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.snapshot.load_full()
    }

    /// The RPC address this router considers "local".
    #[must_use]
    pub fn self_address(&self) -> &str {
        &self.self_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<PeerInfo> {
        (0..n)
            .map(|i| PeerInfo::new(format!("127.0.0.1:{}", 9000 + i), format!("127.0.0.1:{}", 8000 + i)))
            .collect()
    }

    fn req(name: &str, key: &str) -> RateLimitReq {
        RateLimitReq {
            name: name.to_string(),
            unique_key: key.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fnv1a64_known_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_empty_peer_set_is_local() {
        let router = Router::new("127.0.0.1:9000");
        let snap = router.snapshot();
        assert_eq!(snap.owner_of("any", "key"), Owner::Local);
        assert_eq!(snap.peer_count(), 0);
    }

    #[test]
    fn test_owner_is_deterministic() {
        let router = Router::new("127.0.0.1:9000");
        router.set_peers(peers(5));
        let snap = router.snapshot();

        for i in 0..100 {
            let key = format!("account:{i}");
            let first = snap.owner_of("test", &key);
            let second = snap.owner_of("test", &key);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_every_peer_owns_something() {
        let router = Router::new("127.0.0.1:9000");
        router.set_peers(peers(5));
        let snap = router.snapshot();

        let mut owners = std::collections::HashSet::new();
        for i in 0..2_000 {
            match snap.owner_of("test", &format!("account:{i}")) {
                Owner::Local => owners.insert("127.0.0.1:9000".to_string()),
                Owner::Remote(p) => owners.insert(p.grpc_address),
            };
        }
        assert_eq!(owners.len(), 5);
    }

    #[test]
    fn test_split_batch_preserves_indices() {
        let router = Router::new("127.0.0.1:9000");
        router.set_peers(peers(5));
        let snap = router.snapshot();

        for n in [1usize, 2, 5, 10, 100, 1000] {
            let batch: Vec<_> = (0..n)
                .map(|i| req("test_split", &format!("{i:08x}")))
                .collect();
            let plan = snap.split_batch(&batch);

            let mut seen: Vec<usize> = plan.local.clone();
            for (_, (_, idxs)) in &plan.remote {
                seen.extend(idxs);
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..n).collect::<Vec<_>>(), "batch size {n}");
        }
    }

    #[test]
    fn test_snapshot_survives_peer_change() {
        let router = Router::new("127.0.0.1:9000");
        router.set_peers(peers(5));
        let before = router.snapshot();
        assert_eq!(before.peer_count(), 5);

        router.set_peers(peers(2));
        // The captured snapshot is unchanged; new loads see the new set.
        assert_eq!(before.peer_count(), 5);
        assert_eq!(router.snapshot().peer_count(), 2);
    }

    #[test]
    fn test_remote_peers_excludes_self() {
        let router = Router::new("127.0.0.1:9000");
        router.set_peers(peers(3));
        let snap = router.snapshot();
        let remotes: Vec<_> = snap.remote_peers().collect();
        assert_eq!(remotes.len(), 2);
        assert!(remotes.iter().all(|p| p.grpc_address != "127.0.0.1:9000"));
    }
}
