//! Framed RPC server.
//!
//! Accepts persistent TCP connections and processes frames sequentially per
//! connection; different connections are served concurrently. Each call runs
//! under the server-side deadline and a deadline miss surfaces as a
//! top-level [`RpcResult::Error`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::message::{
    decode_frame_length, encode_frame, from_body, to_body, RpcCall, RpcReply, RpcRequest,
    RpcResult, FRAME_HEADER_SIZE,
};

/// Handles decoded RPC calls.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Process one call and produce its result.
    async fn handle(&self, call: RpcCall) -> RpcResult;
}

/// A bound, not yet serving, RPC listener.
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    call_timeout: Duration,
}

/// Control handle for a serving RPC server.
pub struct RpcServerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl RpcServer {
    /// Bind the listener. `addr` may carry port 0; the actual address is
    /// available from [`RpcServer::local_addr`].
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
            call_timeout: Duration::from_secs(30),
        })
    }

    /// Override the per-call deadline (default 30s).
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start serving in a background task.
    pub fn spawn<H: RpcHandler>(self, handler: Arc<H>) -> RpcServerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let addr = self.local_addr;
        let call_timeout = self.call_timeout;
        let listener = self.listener;

        let task = tokio::spawn(async move {
            info!(%addr, "rpc server listening");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                debug!(%remote, "new peer connection");
                                let handler = Arc::clone(&handler);
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        serve_connection(stream, handler, call_timeout).await
                                    {
                                        debug!(%remote, "peer connection closed: {e}");
                                    }
                                });
                            }
                            Err(e) => error!("accept error: {e}"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(%addr, "rpc server shutting down");
                        break;
                    }
                }
            }
        });

        RpcServerHandle { shutdown_tx, task }
    }
}

impl RpcServerHandle {
    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

async fn serve_connection<H: RpcHandler>(
    mut stream: TcpStream,
    handler: Arc<H>,
    call_timeout: Duration,
) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("peer disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let body_len = match decode_frame_length(&header) {
            Some(len) => len,
            None => {
                warn!("oversized frame; dropping connection");
                return Ok(());
            }
        };

        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;

        let request: RpcRequest = match from_body(&body) {
            Ok(req) => req,
            Err(e) => {
                warn!("undecodable frame; dropping connection: {e}");
                return Ok(());
            }
        };

        debug!(id = request.id, call = request.call.name(), "rpc call");

        let result = match tokio::time::timeout(call_timeout, handler.handle(request.call)).await {
            Ok(result) => result,
            Err(_) => RpcResult::Error("deadline exceeded".to_string()),
        };

        let reply = RpcReply {
            id: request.id,
            result,
        };
        let reply_body = match to_body(&reply) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to encode reply: {e}");
                continue;
            }
        };

        stream.write_all(&encode_frame(&reply_body)).await?;
        stream.flush().await?;
    }
}
