//! Integration tests against an in-process cluster of daemons.
//!
//! Each daemon binds port 0 on localhost; once every member is up the full
//! peer list is installed on all of them. Counter time is driven by a shared
//! frozen clock so algorithm behavior is deterministic while the real tokio
//! clock drives batching windows and broadcast cadence.

use std::sync::Arc;
use std::time::Duration;

use gubernator::clock::FrozenClock;
use gubernator::config::DaemonConfig;
use gubernator::router::Owner;
use gubernator::rpc::{RpcCall, RpcClient, RpcResult};
use gubernator::types::{
    Behavior, GetRateLimitsReq, GetRateLimitsResp, HealthCheckResp, RateLimitReq, Status, MINUTE,
    SECOND,
};
use gubernator::{Daemon, PeerInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct TestCluster {
    daemons: Vec<Daemon>,
    clock: FrozenClock,
}

fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.daemon.grpc_listen = "127.0.0.1:0".parse().unwrap();
    config.daemon.http_listen = "127.0.0.1:0".parse().unwrap();
    config.cache.expiry_sweep_ms = 60_000;
    config
}

impl TestCluster {
    async fn start(size: usize) -> Self {
        let clock = FrozenClock::now();
        let mut daemons = Vec::with_capacity(size);
        for _ in 0..size {
            let daemon = Daemon::spawn_with_clock(test_config(), Arc::new(clock.clone()))
                .await
                .expect("daemon failed to start");
            daemons.push(daemon);
        }

        let peers: Vec<PeerInfo> = daemons.iter().map(Daemon::peer_info).collect();
        for daemon in &daemons {
            daemon.set_peers(peers.clone());
        }

        Self { daemons, clock }
    }

    async fn stop(self) {
        for daemon in self.daemons {
            daemon.shutdown().await;
        }
    }

    /// RPC address of the peer owning `(name, key)`.
    fn owner_addr(&self, name: &str, key: &str) -> String {
        let first = &self.daemons[0];
        match first
            .service()
            .router()
            .snapshot()
            .owner_of(name, key)
        {
            Owner::Local => first.peer_info().grpc_address,
            Owner::Remote(peer) => peer.grpc_address,
        }
    }

    fn owner(&self, name: &str, key: &str) -> &Daemon {
        let addr = self.owner_addr(name, key);
        self.daemons
            .iter()
            .find(|d| d.peer_info().grpc_address == addr)
            .expect("owner not in cluster")
    }

    fn non_owners(&self, name: &str, key: &str) -> Vec<&Daemon> {
        let addr = self.owner_addr(name, key);
        self.daemons
            .iter()
            .filter(|d| d.peer_info().grpc_address != addr)
            .collect()
    }
}

async fn get_rate_limits(addr: &str, requests: Vec<RateLimitReq>) -> GetRateLimitsResp {
    let client = RpcClient::new(addr);
    match client
        .call(
            RpcCall::GetRateLimits(GetRateLimitsReq { requests }),
            Duration::from_secs(10),
        )
        .await
        .expect("rpc failed")
    {
        RpcResult::RateLimits(resp) => resp,
        other => panic!("unexpected rpc result: {other:?}"),
    }
}

async fn health_check(addr: &str) -> HealthCheckResp {
    let client = RpcClient::new(addr);
    match client
        .call(RpcCall::HealthCheck, Duration::from_secs(10))
        .await
        .expect("rpc failed")
    {
        RpcResult::Health(resp) => resp,
        other => panic!("unexpected rpc result: {other:?}"),
    }
}

async fn http_request(addr: std::net::SocketAddr, method: &str, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("http connect failed");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

fn http_body(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

fn metric_value(exposition: &str, name: &str) -> f64 {
    exposition
        .lines()
        .find(|line| line.starts_with(name) && !line.starts_with('#'))
        .and_then(|line| line.split_whitespace().last())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0.0)
}

async fn read_metric(daemon: &Daemon, name: &str) -> f64 {
    let metrics = http_request(daemon.http_addr(), "GET", "/metrics", "").await;
    metric_value(http_body(&metrics), name)
}

fn req(name: &str, key: &str, hits: i64, limit: i64, duration: i64) -> RateLimitReq {
    RateLimitReq {
        name: name.to_string(),
        unique_key: key.to_string(),
        hits,
        limit,
        duration,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_over_the_limit() {
    let cluster = TestCluster::start(3).await;
    let addr = cluster.daemons[0].peer_info().grpc_address;

    let expected = [
        (1, Status::UnderLimit),
        (0, Status::UnderLimit),
        (0, Status::OverLimit),
    ];
    for (remaining, status) in expected {
        let resp = get_rate_limits(
            &addr,
            vec![req("test_over_limit", "account:1234", 1, 2, 9 * SECOND)],
        )
        .await;
        let item = &resp.responses[0];
        assert!(item.error.is_empty());
        assert_eq!(item.status, status);
        assert_eq!(item.remaining, remaining);
        assert_eq!(item.limit, 2);
        assert_ne!(item.reset_time, 0);
    }

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_order_matches_request_order() {
    let cluster = TestCluster::start(5).await;
    let addr = cluster.daemons[0].peer_info().grpc_address;

    for n in [1usize, 2, 5, 10, 100, 1000] {
        let requests: Vec<RateLimitReq> = (0..n)
            .map(|i| {
                let mut r = req(
                    "test_batch_order",
                    &format!("{i:08x}"),
                    0,
                    1_000 + i as i64,
                    SECOND,
                );
                r.behavior = Behavior::BATCHING;
                r
            })
            .collect();

        let resp = get_rate_limits(&addr, requests).await;
        assert_eq!(resp.responses.len(), n, "batch size {n}");
        for (i, item) in resp.responses.iter().enumerate() {
            // Identify each response by its unique limit.
            assert_eq!(item.limit, 1_000 + i as i64, "batch size {n}, index {i}");
            assert!(item.error.is_empty(), "batch size {n}, index {i}: {}", item.error);
        }
    }

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cluster_shares_one_counter_per_key() {
    let cluster = TestCluster::start(4).await;

    // The same key hit through every peer lands on one owner.
    let mut remaining = Vec::new();
    for daemon in &cluster.daemons {
        let resp = get_rate_limits(
            &daemon.peer_info().grpc_address,
            vec![req("test_shared_counter", "account:77", 1, 10, MINUTE)],
        )
        .await;
        assert!(resp.responses[0].error.is_empty());
        remaining.push(resp.responses[0].remaining);
    }
    assert_eq!(remaining, vec![9, 8, 7, 6]);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multiple_async_forwards() {
    let cluster = TestCluster::start(5).await;
    let addr = cluster.daemons[0].peer_info().grpc_address;

    let resp = get_rate_limits(
        &addr,
        vec![
            req("test_multiple_async", "account:9234", 1, 2, 9 * SECOND),
            req("test_multiple_async", "account:5678", 5, 10, 9 * SECOND),
        ],
    )
    .await;

    assert_eq!(resp.responses.len(), 2);
    assert_eq!(resp.responses[0].status, Status::UnderLimit);
    assert_eq!(resp.responses[0].remaining, 1);
    assert_eq!(resp.responses[0].limit, 2);
    assert_eq!(resp.responses[1].status, Status::UnderLimit);
    assert_eq!(resp.responses[1].remaining, 5);
    assert_eq!(resp.responses[1].limit, 10);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_global_rate_limits() {
    let name = "test_global";
    let key = "account:12345";
    let cluster = TestCluster::start(6).await;
    let owner = cluster.owner(name, key);
    let peers = cluster.non_owners(name, key);
    assert!(peers.len() >= 5);

    let send = |daemon: &Daemon, hits: i64| {
        let addr = daemon.peer_info().grpc_address;
        async move {
            let mut r = req(name, key, hits, 5, 3 * MINUTE);
            r.behavior = Behavior::GLOBAL;
            let resp = get_rate_limits(&addr, vec![r]).await;
            assert!(resp.responses[0].error.is_empty());
            resp.responses[0].clone()
        }
    };

    // Zero-hit probes read the local snapshot without forwarding, so they
    // can poll for broadcast convergence.
    let converge = |daemon: &Daemon, want: i64| {
        let addr = daemon.peer_info().grpc_address;
        async move {
            let mut last = i64::MIN;
            for _ in 0..50 {
                let mut r = req(name, key, 0, 5, 3 * MINUTE);
                r.behavior = Behavior::GLOBAL;
                let resp = get_rate_limits(&addr, vec![r]).await;
                last = resp.responses[0].remaining;
                if last == want {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            panic!("peer never converged to remaining {want}; last {last}");
        }
    };

    // First hits evaluate on the receiving peer and queue async forwards.
    let resp = send(peers[0], 1).await;
    assert_eq!((resp.status, resp.remaining), (Status::UnderLimit, 4));
    let resp = send(peers[0], 2).await;
    assert_eq!((resp.status, resp.remaining), (Status::UnderLimit, 2));

    // The forwarding peer records at least one global send.
    let mut sent = 0.0;
    for _ in 0..50 {
        sent = read_metric(peers[0], "gubernator_global_send_duration_count").await;
        if sent >= 1.0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(sent >= 1.0, "no global send observed");

    // Other peers get the broadcast.
    converge(peers[1], 2).await;
    converge(peers[2], 2).await;

    // A non-owner deducts from its snapshot before forwarding.
    converge(peers[3], 2).await;
    let resp = send(peers[3], 2).await;
    assert_eq!((resp.status, resp.remaining), (Status::UnderLimit, 0));

    // After the next broadcast the depleted counter is visible cluster-wide.
    converge(peers[4], 0).await;
    let resp = send(peers[4], 1).await;
    assert_eq!(resp.status, Status::OverLimit);

    // The owner broadcast at least twice along the way.
    let broadcasts = read_metric(owner, "gubernator_broadcast_duration_count").await;
    assert!(broadcasts >= 2.0, "expected >= 2 broadcasts, saw {broadcasts}");

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_check_tracks_peer_failures() {
    let name = "test_health_check";
    let key = "account:12345";
    let mut cluster = TestCluster::start(3).await;
    let first_addr = cluster.daemons[0].peer_info().grpc_address;

    let health = health_check(&first_addr).await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.peer_count, 3);

    // Kill the rest of the cluster, remembering their addresses.
    let dead: Vec<(std::net::SocketAddr, std::net::SocketAddr)> = cluster.daemons
        [1..]
        .iter()
        .map(|d| (d.grpc_addr(), d.http_addr()))
        .collect();
    for daemon in cluster.daemons.split_off(1) {
        daemon.shutdown().await;
    }

    // Keep issuing GLOBAL hits until the transport failures surface.
    let mut health = health_check(&first_addr).await;
    for _ in 0..40 {
        let mut r = req(name, key, 1, 100, 3 * MINUTE);
        r.behavior = Behavior::GLOBAL;
        let _ = get_rate_limits(&first_addr, vec![r]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        health = health_check(&first_addr).await;
        if health.status == "unhealthy" && health.message.contains("connection refused") {
            break;
        }
    }
    assert_eq!(health.status, "unhealthy");
    assert!(
        health.message.contains("connection refused"),
        "message: {}",
        health.message
    );

    // Restart the dead peers on their old addresses.
    for (grpc, http) in dead {
        let mut config = test_config();
        config.daemon.grpc_listen = grpc;
        config.daemon.http_listen = http;
        let daemon = Daemon::spawn_with_clock(config, Arc::new(cluster.clock.clone()))
            .await
            .expect("restart failed");
        cluster.daemons.push(daemon);
    }
    let peers: Vec<PeerInfo> = cluster.daemons.iter().map(Daemon::peer_info).collect();
    for daemon in &cluster.daemons {
        daemon.set_peers(peers.clone());
    }

    // Successful broadcasts flip the peer clients back to healthy.
    let mut health = health_check(&first_addr).await;
    for _ in 0..40 {
        let mut r = req(name, key, 1, 100, 3 * MINUTE);
        r.behavior = Behavior::GLOBAL;
        let _ = get_rate_limits(&first_addr, vec![r]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        health = health_check(&first_addr).await;
        if health.status == "healthy" {
            break;
        }
    }
    assert_eq!(health.status, "healthy", "message: {}", health.message);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_gateway_json() {
    let cluster = TestCluster::start(3).await;
    let http_addr = cluster.daemons[0].http_addr();

    // GET alias for HealthCheck; fields must stay snake_case.
    let response = http_request(http_addr, "GET", "/v1/HealthCheck", "").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    let body = http_body(&response);
    assert!(body.contains("peer_count"), "body: {body}");
    let health: HealthCheckResp = serde_json::from_str(body).unwrap();
    assert_eq!(health.peer_count, 3);
    assert_eq!(health.status, "healthy");

    // POST a rate limit check; enums encode as protocol names.
    let payload = serde_json::json!({
        "requests": [{
            "name": "requests_per_sec",
            "unique_key": "account:12345",
            "algorithm": "TOKEN_BUCKET",
            "duration": 1_000,
            "hits": 1,
            "limit": 10
        }]
    })
    .to_string();
    let response = http_request(http_addr, "POST", "/v1/GetRateLimits", &payload).await;
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    let body = http_body(&response);
    assert!(body.contains("\"UNDER_LIMIT\""), "body: {body}");
    let parsed: GetRateLimitsResp = serde_json::from_str(body).unwrap();
    assert_eq!(parsed.responses.len(), 1);
    assert_eq!(parsed.responses[0].remaining, 9);

    // Malformed JSON is a 400, not a hang or a 500.
    let response = http_request(http_addr, "POST", "/v1/GetRateLimits", "{not json").await;
    assert!(response.starts_with("HTTP/1.1 400"), "response: {response}");

    // Unknown paths are 404.
    let response = http_request(http_addr, "GET", "/v1/Nope", "").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metrics_exposition() {
    let cluster = TestCluster::start(2).await;
    let http_addr = cluster.daemons[0].http_addr();

    let response = http_request(http_addr, "GET", "/metrics", "").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    let body = http_body(&response);
    assert!(body.contains("gubernator_broadcast_duration_count"), "body: {body}");
    assert!(body.contains("gubernator_global_send_duration_count"));
    assert!(body.contains("gubernator_cache_size"));

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_validation_errors_over_rpc() {
    let cluster = TestCluster::start(2).await;
    let addr = cluster.daemons[0].peer_info().grpc_address;

    let resp = get_rate_limits(
        &addr,
        vec![
            req("", "account:1234", 1, 5, 10 * SECOND),
            req("test_missing_fields", "", 1, 5, 10 * SECOND),
        ],
    )
    .await;

    assert_eq!(resp.responses[0].error, "field 'namespace' cannot be empty");
    assert_eq!(resp.responses[0].status, Status::UnderLimit);
    assert_eq!(resp.responses[1].error, "field 'unique_key' cannot be empty");
    assert_eq!(resp.responses[1].status, Status::UnderLimit);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_frozen_clock_drives_counter_expiry() {
    let cluster = TestCluster::start(2).await;
    let addr = cluster.daemons[0].peer_info().grpc_address;

    let r = req("test_expiry", "account:9", 1, 2, 5 * SECOND);
    let resp = get_rate_limits(&addr, vec![r.clone()]).await;
    assert_eq!(resp.responses[0].remaining, 1);
    let resp = get_rate_limits(&addr, vec![r.clone()]).await;
    assert_eq!(resp.responses[0].remaining, 0);
    let resp = get_rate_limits(&addr, vec![r.clone()]).await;
    assert_eq!(resp.responses[0].status, Status::OverLimit);

    // Advancing the shared frozen clock expires the window everywhere.
    cluster.clock.advance(6 * SECOND);
    let resp = get_rate_limits(&addr, vec![r]).await;
    assert_eq!(resp.responses[0].status, Status::UnderLimit);
    assert_eq!(resp.responses[0].remaining, 1);

    cluster.stop().await;
}
