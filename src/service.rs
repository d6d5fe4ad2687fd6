//! The rate limit service: validation, routing, evaluation and health.
//!
//! `get_rate_limits` is the client entry: it validates each request, splits
//! the batch by owner, evaluates the local subset under per-key store
//! guards, forwards the rest through the peer clients, and reassembles the
//! responses in request order. `get_peer_rate_limits` is the peer entry and
//! never re-routes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::debug;

use crate::algorithms;
use crate::algorithms::gregorian;
use crate::clock::Clock;
use crate::error::ServiceResult;
use crate::global::GlobalManager;
use crate::metrics::Metrics;
use crate::peer::{PeerPool, PeerState};
use crate::router::{Owner, Router};
use crate::store::CounterStore;
use crate::types::{
    Behavior, Counter, GetRateLimitsReq, GetRateLimitsResp, GlobalUpdate, HealthCheckResp,
    RateLimitReq, RateLimitResp, Status, UpdatePeerGlobalsReq,
};

/// Health status string for a serving daemon.
pub const HEALTHY: &str = "healthy";
/// Health status string when any peer client is unhealthy.
pub const UNHEALTHY: &str = "unhealthy";

/// One peer's rate limiting brain, shared by the RPC server, the HTTP
/// gateway and the global loops.
pub struct RateLimitService {
    store: CounterStore,
    router: Router,
    peers: PeerPool,
    global: GlobalManager,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl RateLimitService {
    /// Assemble the service from its wired components.
    #[must_use]
    pub fn new(
        store: CounterStore,
        router: Router,
        peers: PeerPool,
        global: GlobalManager,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            router,
            peers,
            global,
            clock,
            metrics,
        }
    }

    /// Client entry: route each request to its owner and answer in order.
    ///
    /// `budget` is the caller's remaining deadline; it bounds every
    /// forwarded RPC.
    ///
    /// # Errors
    ///
    /// [`crate::error::ServiceError::Deadline`] when the budget is already
    /// spent, or a store error when the cache cannot hold a live counter.
    pub async fn get_rate_limits(
        &self,
        req: GetRateLimitsReq,
        budget: Duration,
    ) -> ServiceResult<GetRateLimitsResp> {
        if budget.is_zero() {
            return Err(crate::error::ServiceError::Deadline);
        }

        let requests = req.requests;
        let mut out: Vec<Option<RateLimitResp>> = std::iter::repeat_with(|| None)
            .take(requests.len())
            .collect();
        let snapshot = self.router.snapshot();
        let mut forwards: Vec<(crate::peer::PeerInfo, usize)> = Vec::new();

        for (idx, request) in requests.iter().enumerate() {
            if let Some(message) = validate(request) {
                out[idx] = Some(validation_resp(request, message));
                continue;
            }

            let owner = snapshot.owner_of(&request.name, &request.unique_key);
            if request.behavior.has(Behavior::GLOBAL) {
                // GLOBAL answers locally from the last broadcast snapshot
                // (or a fresh seed) no matter who owns the key.
                out[idx] = Some(self.check_local(request)?);
                if mutates(request) {
                    match owner {
                        Owner::Local => self.global.mark_dirty(request),
                        Owner::Remote(_) => self.global.queue_hit(request.clone()),
                    }
                }
                continue;
            }

            match owner {
                Owner::Local => out[idx] = Some(self.check_local(request)?),
                Owner::Remote(peer) => forwards.push((peer, idx)),
            }
        }

        if !forwards.is_empty() {
            debug!(count = forwards.len(), "forwarding to owning peers");
            let calls = forwards.into_iter().map(|(peer, idx)| {
                let request = requests[idx].clone();
                async move {
                    let resp = match self.peers.get(&peer.grpc_address) {
                        Some(client) => client.forward(request, budget).await,
                        None => RateLimitResp {
                            status: Status::OverLimit,
                            limit: request.limit,
                            remaining: 0,
                            reset_time: 0,
                            error: format!("no client for peer {}", peer.grpc_address),
                        },
                    };
                    (idx, resp)
                }
            });
            for (idx, resp) in join_all(calls).await {
                out[idx] = Some(resp);
            }
        }

        let responses = out
            .into_iter()
            .map(|resp| resp.unwrap_or_default())
            .collect();
        Ok(GetRateLimitsResp { responses })
    }

    /// Peer entry: evaluate every request locally, no re-routing.
    ///
    /// Forwarded GLOBAL hits land here; when this peer owns the key the
    /// mutation is queued for the next broadcast.
    ///
    /// # Errors
    ///
    /// A store error when the cache cannot hold a live counter.
    pub fn get_peer_rate_limits(&self, req: GetRateLimitsReq) -> ServiceResult<GetRateLimitsResp> {
        let snapshot = self.router.snapshot();
        let mut responses = Vec::with_capacity(req.requests.len());
        for request in &req.requests {
            if let Some(message) = validate(request) {
                responses.push(validation_resp(request, message));
                continue;
            }
            responses.push(self.check_local(request)?);
            if request.behavior.has(Behavior::GLOBAL)
                && mutates(request)
                && snapshot.owner_of(&request.name, &request.unique_key) == Owner::Local
            {
                self.global.mark_dirty(request);
            }
        }
        Ok(GetRateLimitsResp { responses })
    }

    /// Overwrite local snapshots with an owner's broadcast.
    ///
    /// # Errors
    ///
    /// A store error when the cache cannot hold a live counter.
    pub fn update_peer_globals(&self, req: UpdatePeerGlobalsReq) -> ServiceResult<()> {
        let now = self.clock.now_ms();
        for update in req.globals {
            let key = format!("{}_{}", update.name, update.unique_key);
            let counter = match update.algorithm {
                crate::types::Algorithm::TokenBucket => Counter::TokenBucket {
                    limit: update.limit,
                    duration: update.duration,
                    created_at: now,
                    remaining: update.remaining,
                    reset_time: update.reset_time,
                },
                crate::types::Algorithm::LeakyBucket => Counter::LeakyBucket {
                    limit: update.limit,
                    duration: update.duration,
                    created_at: now,
                    burst: 0,
                    remaining: update.remaining,
                    updated_at: now,
                },
            };
            let mut guard = self.store.guard(&key);
            guard.put(&key, counter, update.reset_time.max(now), now)?;
        }
        Ok(())
    }

    /// Report health: unhealthy iff any peer client is unhealthy.
    #[must_use]
    pub fn health_check(&self) -> HealthCheckResp {
        let mut errors = Vec::new();
        for client in self.peers.all() {
            if client.state() == PeerState::Unhealthy {
                errors.push(format!(
                    "peer {}: {}",
                    client.info().grpc_address,
                    client.last_error()
                ));
            }
        }

        HealthCheckResp {
            status: if errors.is_empty() { HEALTHY } else { UNHEALTHY }.to_string(),
            message: errors.join("; "),
            peer_count: self.router.snapshot().peer_count() as i32,
        }
    }

    /// Evaluate one request against the local counter under its key guard.
    pub(crate) fn check_local(&self, request: &RateLimitReq) -> ServiceResult<RateLimitResp> {
        let now = self.clock.now_ms();
        let key = request.key();

        let resp = {
            let mut guard = self.store.guard(&key);
            let prev = guard.get(&key).cloned();
            let (counter, resp) = algorithms::apply(prev.as_ref(), request, now);
            guard.put(&key, counter, resp.reset_time.max(now), now)?;
            resp
        };

        self.metrics.check_counter.inc();
        if resp.status == Status::OverLimit {
            self.metrics.over_limit_counter.inc();
        }
        Ok(resp)
    }

    /// Apply a hit without routing; used when a queued global hit turns out
    /// to be locally owned.
    pub(crate) fn apply_local(&self, request: &RateLimitReq) -> ServiceResult<()> {
        self.check_local(request)?;
        self.global.mark_dirty(request);
        Ok(())
    }

    /// Read back a counter as a broadcast payload, leaking it up to date
    /// first. Returns `None` when the counter vanished from the cache.
    pub(crate) fn snapshot_counter(&self, request: &RateLimitReq) -> Option<GlobalUpdate> {
        let mut probe = request.clone();
        probe.hits = 0;
        // Only the duration interpretation survives into the probe; flags
        // like RESET_REMAINING must not re-fire here.
        probe.behavior = Behavior(request.behavior.0 & Behavior::DURATION_IS_GREGORIAN.0);

        let resp = self.check_local(&probe).ok()?;
        Some(GlobalUpdate {
            name: request.name.clone(),
            unique_key: request.unique_key.clone(),
            algorithm: request.algorithm,
            duration: request.duration,
            limit: resp.limit,
            remaining: resp.remaining,
            reset_time: resp.reset_time,
        })
    }

    /// The counter store.
    #[must_use]
    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    /// The request router.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The peer client pool.
    #[must_use]
    pub fn peers(&self) -> &PeerPool {
        &self.peers
    }

    /// The global-behavior manager.
    #[must_use]
    pub fn global(&self) -> &GlobalManager {
        &self.global
    }

    /// The injected clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The metrics handles.
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Zero-hit probes don't move the counter, so they neither forward nor
/// broadcast; RESET_REMAINING mutates even with zero hits.
fn mutates(request: &RateLimitReq) -> bool {
    request.hits != 0 || request.behavior.has(Behavior::RESET_REMAINING)
}

/// Validate a request, returning the in-band error message if invalid.
fn validate(request: &RateLimitReq) -> Option<&'static str> {
    if request.name.is_empty() {
        return Some("field 'namespace' cannot be empty");
    }
    if request.unique_key.is_empty() {
        return Some("field 'unique_key' cannot be empty");
    }
    if request.behavior.has(Behavior::DURATION_IS_GREGORIAN)
        && gregorian::unit_from_duration(request.duration).is_none()
    {
        return Some("behavior DURATION_IS_GREGORIAN is set; but 'duration' is not a valid gregorian interval");
    }
    None
}

fn validation_resp(request: &RateLimitReq, message: &str) -> RateLimitResp {
    // Validation failures answer UNDER_LIMIT by convention so clients always
    // look at the error field.
    RateLimitResp {
        status: Status::UnderLimit,
        limit: request.limit,
        remaining: 0,
        reset_time: 0,
        error: message.to_string(),
    }
}
