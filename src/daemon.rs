//! Daemon assembly and lifecycle.
//!
//! Wires the store, router, peer pool, global loops and both listeners from
//! a [`DaemonConfig`], and tears everything down in reverse order on
//! shutdown. Components are wired once at startup; there are no runtime
//! cycles to break.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::DaemonConfig;
use crate::global::{self, GlobalConfig, GlobalManager, LoopHandle};
use crate::http::{HttpGateway, HttpGatewayHandle};
use crate::metrics::Metrics;
use crate::peer::{PeerClientConfig, PeerInfo, PeerPool};
use crate::router::Router;
use crate::rpc::{RpcCall, RpcHandler, RpcResult, RpcServer, RpcServerHandle};
use crate::service::RateLimitService;
use crate::store::CounterStore;

/// Errors raised while starting a daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A listener could not be bound.
    #[error("failed to bind {what} listener: {source}")]
    Bind {
        /// Which listener failed.
        what: &'static str,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

/// A running rate limiting daemon.
pub struct Daemon {
    service: Arc<RateLimitService>,
    advertise: PeerInfo,
    grpc_addr: SocketAddr,
    http_addr: SocketAddr,
    rpc_handle: Option<RpcServerHandle>,
    http_handle: Option<HttpGatewayHandle>,
    broadcaster: Option<LoopHandle>,
    forwarder: Option<LoopHandle>,
    sweeper: Option<LoopHandle>,
}

impl Daemon {
    /// Start a daemon on the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error when a listener cannot be bound.
    pub async fn spawn(config: DaemonConfig) -> DaemonResult<Self> {
        Self::spawn_with_clock(config, Arc::new(SystemClock::new())).await
    }

    /// Start a daemon with an injected clock (tests freeze it).
    ///
    /// # Errors
    ///
    /// Returns an error when a listener cannot be bound.
    pub async fn spawn_with_clock(
        config: DaemonConfig,
        clock: Arc<dyn Clock>,
    ) -> DaemonResult<Self> {
        let rpc_server = RpcServer::bind(config.daemon.grpc_listen)
            .await
            .map_err(|source| DaemonError::Bind {
                what: "rpc",
                source,
            })?
            .with_call_timeout(Duration::from_millis(config.behavior.call_timeout_ms));
        let gateway = HttpGateway::bind(config.daemon.http_listen)
            .await
            .map_err(|source| DaemonError::Bind {
                what: "http",
                source,
            })?
            .with_call_budget(Duration::from_millis(config.behavior.call_timeout_ms));

        let grpc_addr = rpc_server.local_addr();
        let http_addr = gateway.local_addr();
        let advertise = PeerInfo {
            grpc_address: config.daemon.advertise_grpc.unwrap_or(grpc_addr).to_string(),
            http_address: config.daemon.advertise_http.unwrap_or(http_addr).to_string(),
            data_center: config.daemon.data_center.clone(),
        };

        let metrics = Arc::new(Metrics::new());
        let store = CounterStore::new(config.cache.capacity, config.cache.shards);
        let router = Router::new(advertise.grpc_address.clone());
        let peers = PeerPool::new(PeerClientConfig {
            batch_window: Duration::from_micros(config.behavior.batch_window_us),
            batch_limit: config.behavior.batch_limit,
            queue_depth: config.behavior.batch_queue_depth,
        });
        let global = GlobalManager::new(GlobalConfig {
            broadcast_interval: Duration::from_millis(config.behavior.global_broadcast_ms),
            queue_depth: config.behavior.global_queue_depth,
            rpc_budget: Duration::from_millis(config.behavior.global_rpc_timeout_ms),
        });

        let service = Arc::new(RateLimitService::new(
            store,
            router,
            peers,
            global,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));

        let rpc_handle = rpc_server.spawn(Arc::new(ServiceHandler {
            service: Arc::clone(&service),
            budget: Duration::from_millis(config.behavior.call_timeout_ms),
        }));
        let http_handle = gateway.spawn(Arc::clone(&service));

        let forwarder = global::spawn_forwarder(Arc::clone(&service)).await;
        let broadcaster = global::spawn_broadcaster(Arc::clone(&service));
        let sweeper = spawn_sweeper(
            Arc::clone(&service),
            Duration::from_millis(config.cache.expiry_sweep_ms.max(1)),
        );

        let daemon = Self {
            service,
            advertise,
            grpc_addr,
            http_addr,
            rpc_handle: Some(rpc_handle),
            http_handle: Some(http_handle),
            broadcaster: Some(broadcaster),
            forwarder,
            sweeper: Some(sweeper),
        };

        if !config.peers.static_members.is_empty() {
            daemon.set_peers(config.peers.static_members.clone());
        }

        info!(
            name = %config.daemon.name,
            grpc = %daemon.grpc_addr,
            http = %daemon.http_addr,
            "daemon started"
        );
        Ok(daemon)
    }

    /// The bound RPC address.
    #[must_use]
    pub fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    /// The bound HTTP address.
    #[must_use]
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// This daemon's advertised identity.
    #[must_use]
    pub fn peer_info(&self) -> PeerInfo {
        self.advertise.clone()
    }

    /// The underlying service, shared with the listeners.
    #[must_use]
    pub fn service(&self) -> &Arc<RateLimitService> {
        &self.service
    }

    /// Install a new peer set: the router publishes a fresh snapshot and
    /// the client pool reconciles against the remote members.
    pub fn set_peers(&self, peers: Vec<PeerInfo>) {
        let remote: Vec<PeerInfo> = peers
            .iter()
            .filter(|p| p.grpc_address != self.advertise.grpc_address)
            .cloned()
            .collect();
        self.service.peers().sync(&remote);
        self.service.router().set_peers(peers);
    }

    /// Stop listeners and loops in reverse order of startup and drain
    /// in-flight work.
    pub async fn shutdown(mut self) {
        debug!(grpc = %self.grpc_addr, "daemon shutting down");
        if let Some(handle) = self.http_handle.take() {
            handle.shutdown().await;
        }
        if let Some(handle) = self.rpc_handle.take() {
            handle.shutdown().await;
        }
        if let Some(handle) = self.broadcaster.take() {
            handle.shutdown().await;
        }
        if let Some(handle) = self.forwarder.take() {
            handle.shutdown().await;
        }
        if let Some(handle) = self.sweeper.take() {
            handle.shutdown().await;
        }
        info!(grpc = %self.grpc_addr, "daemon stopped");
    }
}

struct ServiceHandler {
    service: Arc<RateLimitService>,
    budget: Duration,
}

#[async_trait]
impl RpcHandler for ServiceHandler {
    async fn handle(&self, call: RpcCall) -> RpcResult {
        match call {
            RpcCall::GetRateLimits(req) => {
                match self.service.get_rate_limits(req, self.budget).await {
                    Ok(resp) => RpcResult::RateLimits(resp),
                    Err(e) => RpcResult::Error(e.to_string()),
                }
            }
            RpcCall::GetPeerRateLimits(req) => match self.service.get_peer_rate_limits(req) {
                Ok(resp) => RpcResult::RateLimits(resp),
                Err(e) => RpcResult::Error(e.to_string()),
            },
            RpcCall::UpdatePeerGlobals(req) => match self.service.update_peer_globals(req) {
                Ok(()) => RpcResult::Updated,
                Err(e) => RpcResult::Error(e.to_string()),
            },
            RpcCall::HealthCheck => RpcResult::Health(self.service.health_check()),
        }
    }
}

/// Periodically drop expired counters and refresh the cache-size gauge.
fn spawn_sweeper(service: Arc<RateLimitService>, interval: Duration) -> LoopHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = service.clock().now_ms();
                    let reaped = service.store().reap_expired(now);
                    if reaped > 0 {
                        debug!(reaped, "swept expired counters");
                    }
                    service.metrics().cache_size.set(service.store().len() as i64);
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
    LoopHandle::new(shutdown_tx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GetRateLimitsReq, RateLimitReq, Status, SECOND};

    fn config_on_free_ports() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.daemon.grpc_listen = "127.0.0.1:0".parse().unwrap();
        config.daemon.http_listen = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[tokio::test]
    async fn test_daemon_start_and_shutdown() {
        let daemon = Daemon::spawn(config_on_free_ports()).await.unwrap();
        assert_ne!(daemon.grpc_addr().port(), 0);
        assert_ne!(daemon.http_addr().port(), 0);

        let resp = daemon
            .service()
            .get_rate_limits(
                GetRateLimitsReq {
                    requests: vec![RateLimitReq {
                        name: "test_daemon".to_string(),
                        unique_key: "account:1".to_string(),
                        hits: 1,
                        limit: 10,
                        duration: 9 * SECOND,
                        ..Default::default()
                    }],
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(resp.responses[0].status, Status::UnderLimit);
        assert_eq!(resp.responses[0].remaining, 9);

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_peers_excludes_self_from_pool() {
        let daemon = Daemon::spawn(config_on_free_ports()).await.unwrap();
        let me = daemon.peer_info();
        let other = PeerInfo::new("127.0.0.1:59999", "127.0.0.1:59998");

        daemon.set_peers(vec![me.clone(), other.clone()]);

        let snapshot = daemon.service().router().snapshot();
        assert_eq!(snapshot.peer_count(), 2);
        assert!(daemon.service().peers().get(&me.grpc_address).is_none());
        assert!(daemon.service().peers().get(&other.grpc_address).is_some());

        daemon.shutdown().await;
    }
}
