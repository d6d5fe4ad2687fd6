//! Outbound client for one remote peer.
//!
//! Forwarded requests funnel through a small bounded queue drained by a
//! worker task. Requests that arrive within the coalescing window leave as a
//! single `GetPeerRateLimits` RPC; transport failures are answered in-band
//! with OVER_LIMIT plus the error text and flip the peer to `Unhealthy`
//! until the next successful call.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::info::PeerInfo;
use crate::rpc::{RpcCall, RpcClient, RpcClientResult, RpcResult};
use crate::types::{
    Behavior, GetRateLimitsReq, RateLimitReq, RateLimitResp, Status, UpdatePeerGlobalsReq,
};

/// Floor for any forwarded RPC deadline.
pub const MIN_RPC_BUDGET: Duration = Duration::from_millis(50);

/// Connection health of a peer client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    /// No RPC has completed yet.
    Connecting = 0,
    /// The last RPC succeeded.
    Connected = 1,
    /// The last RPC failed; the health check reports this peer.
    Unhealthy = 2,
}

/// Tuning for the forwarding queue.
#[derive(Debug, Clone)]
pub struct PeerClientConfig {
    /// How long the worker waits for more requests before flushing.
    pub batch_window: Duration,
    /// Maximum requests per flushed RPC.
    pub batch_limit: usize,
    /// Bound on queued requests; overflow is answered in-band.
    pub queue_depth: usize,
}

impl Default for PeerClientConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_micros(500),
            batch_limit: 1_000,
            queue_depth: 4_096,
        }
    }
}

struct Queued {
    req: RateLimitReq,
    budget: Duration,
    resp_tx: oneshot::Sender<RateLimitResp>,
}

#[derive(Debug)]
struct Shared {
    rpc: RpcClient,
    state: AtomicU8,
    last_error: std::sync::Mutex<String>,
}

impl Shared {
    fn mark_connected(&self) {
        self.state.store(PeerState::Connected as u8, Ordering::Release);
    }

    fn mark_unhealthy(&self, message: &str) {
        self.state
            .store(PeerState::Unhealthy as u8, Ordering::Release);
        *self.last_error.lock().expect("peer error lock poisoned") = message.to_string();
    }
}

/// Client for a single remote peer.
#[derive(Debug)]
pub struct PeerClient {
    info: PeerInfo,
    shared: Arc<Shared>,
    queue_tx: mpsc::Sender<Queued>,
}

impl PeerClient {
    /// Create the client and start its queue worker.
    #[must_use]
    pub fn new(info: PeerInfo, config: PeerClientConfig) -> Self {
        let shared = Arc::new(Shared {
            rpc: RpcClient::new(info.grpc_address.clone()),
            state: AtomicU8::new(PeerState::Connecting as u8),
            last_error: std::sync::Mutex::new(String::new()),
        });

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth);
        tokio::spawn(run_worker(
            Arc::clone(&shared),
            queue_rx,
            config.batch_window,
            config.batch_limit,
        ));

        Self {
            info,
            shared,
            queue_tx,
        }
    }

    /// Identity of the remote peer.
    #[must_use]
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Current connection health.
    #[must_use]
    pub fn state(&self) -> PeerState {
        match self.shared.state.load(Ordering::Acquire) {
            0 => PeerState::Connecting,
            1 => PeerState::Connected,
            _ => PeerState::Unhealthy,
        }
    }

    /// Message from the most recent transport failure.
    #[must_use]
    pub fn last_error(&self) -> String {
        self.shared
            .last_error
            .lock()
            .expect("peer error lock poisoned")
            .clone()
    }

    /// Forward one request to this peer and wait for its answer.
    ///
    /// `budget` is the caller's remaining deadline; the RPC never runs with
    /// less than [`MIN_RPC_BUDGET`]. Failures come back in-band.
    pub async fn forward(&self, req: RateLimitReq, budget: Duration) -> RateLimitResp {
        if req.behavior.has(Behavior::NO_BATCHING) {
            return match self.send_batch(vec![req.clone()], budget).await {
                Ok(mut responses) if responses.len() == 1 => responses.remove(0),
                Ok(_) => transport_resp(&req, "peer returned a mismatched response batch"),
                Err(e) => transport_resp(&req, &e.to_string()),
            };
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let queued = Queued {
            req: req.clone(),
            budget,
            resp_tx,
        };
        if self.queue_tx.try_send(queued).is_err() {
            warn!(peer = %self.info.grpc_address, "peer request queue is full");
            return transport_resp(&req, "peer request queue is full");
        }

        match resp_rx.await {
            Ok(resp) => resp,
            Err(_) => transport_resp(&req, "peer client shut down before replying"),
        }
    }

    /// Send a pre-assembled batch as one `GetPeerRateLimits` RPC.
    ///
    /// Used by the queue worker and by the global forwarder, which does its
    /// own aggregation.
    ///
    /// # Errors
    ///
    /// Transport or protocol errors, after flipping health state.
    pub async fn send_batch(
        &self,
        requests: Vec<RateLimitReq>,
        budget: Duration,
    ) -> RpcClientResult<Vec<RateLimitResp>> {
        send_batch_shared(&self.shared, requests, budget).await
    }

    /// Push authoritative global counters to this peer.
    ///
    /// # Errors
    ///
    /// Transport or protocol errors, after flipping health state.
    pub async fn update_globals(
        &self,
        update: UpdatePeerGlobalsReq,
        budget: Duration,
    ) -> RpcClientResult<()> {
        let timeout = budget.max(MIN_RPC_BUDGET);
        let result = self
            .shared
            .rpc
            .call(RpcCall::UpdatePeerGlobals(update), timeout)
            .await;
        match result {
            Ok(RpcResult::Updated) => {
                self.shared.mark_connected();
                Ok(())
            }
            Ok(RpcResult::Error(message)) => {
                self.shared.mark_unhealthy(&message);
                Err(crate::rpc::RpcClientError::Protocol(message))
            }
            Ok(_) => {
                let message = "unexpected reply to UpdatePeerGlobals".to_string();
                self.shared.mark_unhealthy(&message);
                Err(crate::rpc::RpcClientError::Protocol(message))
            }
            Err(e) => {
                self.shared.mark_unhealthy(&e.to_string());
                Err(e)
            }
        }
    }
}

async fn send_batch_shared(
    shared: &Shared,
    requests: Vec<RateLimitReq>,
    budget: Duration,
) -> RpcClientResult<Vec<RateLimitResp>> {
    let timeout = budget.max(MIN_RPC_BUDGET);
    let call = RpcCall::GetPeerRateLimits(GetRateLimitsReq { requests });
    match shared.rpc.call(call, timeout).await {
        Ok(RpcResult::RateLimits(resp)) => {
            shared.mark_connected();
            Ok(resp.responses)
        }
        Ok(RpcResult::Error(message)) => {
            shared.mark_unhealthy(&message);
            Err(crate::rpc::RpcClientError::Protocol(message))
        }
        Ok(_) => {
            let message = "unexpected reply to GetPeerRateLimits".to_string();
            shared.mark_unhealthy(&message);
            Err(crate::rpc::RpcClientError::Protocol(message))
        }
        Err(e) => {
            shared.mark_unhealthy(&e.to_string());
            Err(e)
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    mut queue_rx: mpsc::Receiver<Queued>,
    window: Duration,
    batch_limit: usize,
) {
    while let Some(first) = queue_rx.recv().await {
        let mut batch = vec![first];
        let flush_at = tokio::time::Instant::now() + window;

        while batch.len() < batch_limit {
            match tokio::time::timeout_at(flush_at, queue_rx.recv()).await {
                Ok(Some(queued)) => batch.push(queued),
                Ok(None) | Err(_) => break,
            }
        }

        flush(&shared, batch).await;
    }
    debug!("peer queue worker exiting");
}

async fn flush(shared: &Shared, batch: Vec<Queued>) {
    // The tightest caller budget bounds the whole flush.
    let budget = batch
        .iter()
        .map(|q| q.budget)
        .min()
        .unwrap_or(MIN_RPC_BUDGET);
    let requests: Vec<RateLimitReq> = batch.iter().map(|q| q.req.clone()).collect();

    match send_batch_shared(shared, requests, budget).await {
        Ok(responses) if responses.len() == batch.len() => {
            for (queued, resp) in batch.into_iter().zip(responses) {
                let _ = queued.resp_tx.send(resp);
            }
        }
        Ok(responses) => {
            let message = format!(
                "peer returned {} responses for {} requests",
                responses.len(),
                batch.len()
            );
            for queued in batch {
                let resp = transport_resp(&queued.req, &message);
                let _ = queued.resp_tx.send(resp);
            }
        }
        Err(e) => {
            let message = e.to_string();
            for queued in batch {
                let resp = transport_resp(&queued.req, &message);
                let _ = queued.resp_tx.send(resp);
            }
        }
    }
}

fn transport_resp(req: &RateLimitReq, message: &str) -> RateLimitResp {
    RateLimitResp {
        status: Status::OverLimit,
        limit: req.limit,
        remaining: 0,
        reset_time: 0,
        error: message.to_string(),
    }
}
