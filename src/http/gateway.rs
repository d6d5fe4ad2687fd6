//! JSON transcoder for the RPC surface plus `/metrics`.
//!
//! Every RPC is reachable as `POST /v1/<Operation>` with a JSON body; field
//! names are snake_case and enums use their protocol string names.
//! `GET /v1/HealthCheck` is accepted as an alias, and `GET /metrics` serves
//! the Prometheus text exposition.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::service::RateLimitService;
use crate::types::{GetRateLimitsReq, UpdatePeerGlobalsReq};

/// A bound, not yet serving, HTTP gateway.
pub struct HttpGateway {
    listener: TcpListener,
    local_addr: SocketAddr,
    call_budget: Duration,
}

/// Control handle for a serving gateway.
pub struct HttpGatewayHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl HttpGateway {
    /// Bind the listener. `addr` may carry port 0.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            call_budget: Duration::from_secs(30),
        })
    }

    /// Override the per-call budget handed to the service (default 30s).
    #[must_use]
    pub fn with_call_budget(mut self, budget: Duration) -> Self {
        self.call_budget = budget;
        self
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start serving in a background task.
    pub fn spawn(self, service: Arc<RateLimitService>) -> HttpGatewayHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let addr = self.local_addr;
        let listener = self.listener;
        let budget = self.call_budget;

        let task = tokio::spawn(async move {
            info!(%addr, "http gateway listening");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                debug!(%remote, "new http connection");
                                let service = Arc::clone(&service);
                                tokio::spawn(async move {
                                    let io = TokioIo::new(stream);
                                    let handler = service_fn(move |req| {
                                        let service = Arc::clone(&service);
                                        async move { handle_request(req, &service, budget).await }
                                    });
                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, handler)
                                        .await
                                    {
                                        debug!("http connection error: {e}");
                                    }
                                });
                            }
                            Err(e) => error!("http accept error: {e}"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(%addr, "http gateway shutting down");
                        break;
                    }
                }
            }
        });

        HttpGatewayHandle { shutdown_tx, task }
    }
}

impl HttpGatewayHandle {
    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

async fn handle_request(
    req: Request<Incoming>,
    service: &RateLimitService,
    budget: Duration,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            service.metrics().encode_text(),
        ),
        (Method::GET | Method::POST, "/v1/HealthCheck") => {
            json_response(StatusCode::OK, &service.health_check())
        }
        (Method::POST, "/v1/GetRateLimits") => match read_json::<GetRateLimitsReq>(req).await {
            Ok(body) => match service.get_rate_limits(body, budget).await {
                Ok(resp) => json_response(StatusCode::OK, &resp),
                Err(e) => text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            },
            Err(message) => text_response(StatusCode::BAD_REQUEST, "text/plain", message),
        },
        (Method::POST, "/v1/GetPeerRateLimits") => match read_json::<GetRateLimitsReq>(req).await {
            Ok(body) => match service.get_peer_rate_limits(body) {
                Ok(resp) => json_response(StatusCode::OK, &resp),
                Err(e) => text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            },
            Err(message) => text_response(StatusCode::BAD_REQUEST, "text/plain", message),
        },
        (Method::POST, "/v1/UpdatePeerGlobals") => {
            match read_json::<UpdatePeerGlobalsReq>(req).await {
                Ok(body) => match service.update_peer_globals(body) {
                    Ok(()) => json_response(StatusCode::OK, &serde_json::json!({})),
                    Err(e) => text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                },
                Err(message) => text_response(StatusCode::BAD_REQUEST, "text/plain", message),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };

    Ok(response)
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, String> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("failed to read body: {e}"))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON body: {e}"))
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .expect("response build failed"),
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("failed to encode response: {e}"),
        ),
    }
}

fn text_response(
    status: StatusCode,
    content_type: &str,
    body: String,
) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("response build failed")
}
