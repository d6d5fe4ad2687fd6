//! GLOBAL behavior: async hit forwarding and owner broadcasts.
//!
//! A peer answering a GLOBAL request replies immediately from its local
//! snapshot of the counter. If it does not own the key it also queues the
//! hit here; the forward loop pushes queued hits to their owners. Owners
//! collect the keys they mutated and broadcast the authoritative counters
//! to every peer on a fixed cadence. Broadcasts overwrite local snapshots
//! unconditionally, so between two broadcasts the cluster may over-admit by
//! up to `remaining x peer_count`; that bound is the documented price of
//! the eventually-consistent mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::service::RateLimitService;
use crate::types::{GlobalUpdate, RateLimitReq, UpdatePeerGlobalsReq};

/// Tuning for the global loops.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Cadence of owner broadcasts.
    pub broadcast_interval: Duration,
    /// Bound on hits waiting to be forwarded to owners.
    pub queue_depth: usize,
    /// Deadline for each forward or broadcast RPC.
    pub rpc_budget: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_millis(100),
            queue_depth: 10_000,
            rpc_budget: Duration::from_secs(5),
        }
    }
}

/// Queues and dirty-key bookkeeping shared between the request path and the
/// background loops.
#[derive(Debug)]
pub struct GlobalManager {
    config: GlobalConfig,
    hits_tx: mpsc::Sender<RateLimitReq>,
    /// Taken once by the forward loop.
    hits_rx: Mutex<Option<mpsc::Receiver<RateLimitReq>>>,
    /// Keys this peer owns that changed since the last broadcast; the stored
    /// request rebuilds the broadcast payload.
    dirty: std::sync::Mutex<HashMap<String, RateLimitReq>>,
}

impl GlobalManager {
    /// Create the manager and its forward queue.
    #[must_use]
    pub fn new(config: GlobalConfig) -> Self {
        let (hits_tx, hits_rx) = mpsc::channel(config.queue_depth);
        Self {
            config,
            hits_tx,
            hits_rx: Mutex::new(Some(hits_rx)),
            dirty: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Queue a hit for async forwarding to its owner.
    ///
    /// A full queue drops the hit: the local answer already went out and the
    /// next broadcast reconciles the counter.
    pub fn queue_hit(&self, req: RateLimitReq) {
        if self.hits_tx.try_send(req).is_err() {
            warn!("global hit queue is full; dropping forward");
        }
    }

    /// Record that this peer, as owner, mutated a global key.
    pub fn mark_dirty(&self, req: &RateLimitReq) {
        self.dirty
            .lock()
            .expect("global dirty lock poisoned")
            .insert(req.key(), req.clone());
    }

    /// Take every dirty key, leaving the set empty.
    #[must_use]
    pub fn take_dirty(&self) -> Vec<RateLimitReq> {
        let mut dirty = self.dirty.lock().expect("global dirty lock poisoned");
        dirty.drain().map(|(_, req)| req).collect()
    }

    /// The configured tuning.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }
}

/// Handle to a running background loop.
pub struct LoopHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl LoopHandle {
    pub(crate) fn new(shutdown_tx: mpsc::Sender<()>, task: tokio::task::JoinHandle<()>) -> Self {
        Self { shutdown_tx, task }
    }

    /// Signal the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Start the forward loop: drains queued hits and pushes them to owners.
///
/// Returns `None` if the loop was already started.
pub async fn spawn_forwarder(service: Arc<RateLimitService>) -> Option<LoopHandle> {
    let mut hits_rx = service.global().hits_rx.lock().await.take()?;
    let budget = service.global().config.rpc_budget;
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hits_rx.recv() => {
                    let Some(first) = received else { break };
                    let mut hits = vec![first];
                    while hits.len() < 1_000 {
                        match hits_rx.try_recv() {
                            Ok(req) => hits.push(req),
                            Err(_) => break,
                        }
                    }
                    forward_hits(&service, hits, budget).await;
                }
                _ = shutdown_rx.recv() => {
                    // Drain whatever is already queued before exiting.
                    let mut hits = Vec::new();
                    while let Ok(req) = hits_rx.try_recv() {
                        hits.push(req);
                    }
                    if !hits.is_empty() {
                        forward_hits(&service, hits, budget).await;
                    }
                    break;
                }
            }
        }
        debug!("global forward loop exiting");
    });

    Some(LoopHandle { shutdown_tx, task })
}

/// Start the broadcast loop: pushes dirty owned counters to all peers.
pub fn spawn_broadcaster(service: Arc<RateLimitService>) -> LoopHandle {
    let interval = service.global().config.broadcast_interval;
    let budget = service.global().config.rpc_budget;
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    broadcast_dirty(&service, budget).await;
                }
                _ = shutdown_rx.recv() => {
                    // Final broadcast so peers converge on shutdown state.
                    broadcast_dirty(&service, budget).await;
                    break;
                }
            }
        }
        debug!("global broadcast loop exiting");
    });

    LoopHandle { shutdown_tx, task }
}

/// Aggregate queued hits per key and send them to their owners.
async fn forward_hits(service: &RateLimitService, hits: Vec<RateLimitReq>, budget: Duration) {
    let start = std::time::Instant::now();

    // Collapse repeated hits on the same key into one claim; the most
    // recent request wins the limit and behavior fields.
    let mut merged: HashMap<String, RateLimitReq> = HashMap::new();
    for req in hits {
        match merged.get_mut(&req.key()) {
            Some(existing) => {
                let hits = existing.hits + req.hits;
                *existing = req;
                existing.hits = hits;
            }
            None => {
                merged.insert(req.key(), req);
            }
        }
    }

    // Group by owner under the current ring.
    let snapshot = service.router().snapshot();
    let mut per_owner: HashMap<String, Vec<RateLimitReq>> = HashMap::new();
    let mut local = Vec::new();
    for (_, req) in merged {
        match snapshot.owner_of(&req.name, &req.unique_key) {
            crate::router::Owner::Local => local.push(req),
            crate::router::Owner::Remote(peer) => {
                per_owner.entry(peer.grpc_address).or_default().push(req);
            }
        }
    }

    // Ownership moved to us while the hit sat in the queue; apply directly.
    for req in local {
        if let Err(e) = service.apply_local(&req) {
            warn!("failed to apply re-homed global hit: {e}");
        }
    }

    let sends = per_owner.into_iter().map(|(addr, reqs)| {
        let service = service;
        async move {
            match service.peers().get(&addr) {
                Some(client) => {
                    if let Err(e) = client.send_batch(reqs, budget).await {
                        warn!(peer = %addr, "global forward failed: {e}");
                    }
                }
                None => warn!(peer = %addr, "no client for global forward"),
            }
        }
    });
    let count = join_all(sends).await.len();

    if count > 0 {
        service
            .metrics()
            .global_send_duration
            .observe(start.elapsed().as_secs_f64());
    }
}

/// Broadcast every dirty owned counter to all remote peers.
async fn broadcast_dirty(service: &RateLimitService, budget: Duration) {
    let dirty = service.global().take_dirty();
    if dirty.is_empty() {
        return;
    }

    let start = std::time::Instant::now();
    let mut globals: Vec<GlobalUpdate> = Vec::with_capacity(dirty.len());
    for req in &dirty {
        if let Some(update) = service.snapshot_counter(req) {
            globals.push(update);
        }
    }

    if !globals.is_empty() {
        let update = UpdatePeerGlobalsReq { globals };
        let snapshot = service.router().snapshot();
        let pushes = snapshot.remote_peers().map(|peer| {
            let update = update.clone();
            let addr = peer.grpc_address.clone();
            async move {
                match service.peers().get(&addr) {
                    Some(client) => {
                        if let Err(e) = client.update_globals(update, budget).await {
                            warn!(peer = %addr, "broadcast failed: {e}");
                        }
                    }
                    None => warn!(peer = %addr, "no client for broadcast"),
                }
            }
        });
        join_all(pushes).await;
    }

    service
        .metrics()
        .broadcast_duration
        .observe(start.elapsed().as_secs_f64());
}
