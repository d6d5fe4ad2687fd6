//! Framed RPC client.
//!
//! Holds one persistent connection per remote address, established lazily
//! and replaced after any transport error. A connection carries one request
//! at a time; callers that want pipelining batch at a higher layer (see
//! [`crate::peer::PeerClient`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::message::{
    decode_frame_length, encode_frame, from_body, to_body, RpcCall, RpcReply, RpcRequest,
    FRAME_HEADER_SIZE,
};

/// Errors raised by the RPC client.
#[derive(Debug, Error)]
pub enum RpcClientError {
    /// TCP connect failed.
    #[error("failed to connect to {addr}: {message}")]
    Connect {
        /// Remote address.
        addr: String,
        /// Underlying io error text.
        message: String,
    },

    /// The request could not be written.
    #[error("send error: {0}")]
    Send(String),

    /// The reply could not be read.
    #[error("receive error: {0}")]
    Receive(String),

    /// The reply could not be decoded or did not match the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The call did not complete within its deadline.
    #[error("rpc deadline exceeded after {0:?}")]
    Timeout(Duration),
}

/// Result alias for RPC client operations.
pub type RpcClientResult<T> = Result<T, RpcClientError>;

/// A lazily connected, self-healing RPC client for one remote peer.
#[derive(Debug)]
pub struct RpcClient {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Create a client for `addr` without connecting yet.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// The remote address this client talks to.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Issue one call and wait for its reply, bounded by `timeout`.
    ///
    /// Any failure tears the connection down; the next call reconnects.
    ///
    /// # Errors
    ///
    /// Transport, protocol, or deadline errors; the caller decides whether
    /// to surface them in-band or flip health state.
    pub async fn call(&self, call: RpcCall, timeout: Duration) -> RpcClientResult<super::message::RpcResult> {
        let mut conn = self.conn.lock().await;

        match tokio::time::timeout(timeout, self.call_locked(&mut conn, call)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                *conn = None;
                Err(e)
            }
            Err(_) => {
                // The stream may hold a half-written frame; start fresh.
                *conn = None;
                Err(RpcClientError::Timeout(timeout))
            }
        }
    }

    async fn call_locked(
        &self,
        conn: &mut Option<TcpStream>,
        call: RpcCall,
    ) -> RpcClientResult<super::message::RpcResult> {
        if conn.is_none() {
            let stream =
                TcpStream::connect(&self.addr)
                    .await
                    .map_err(|e| RpcClientError::Connect {
                        addr: self.addr.clone(),
                        message: e.to_string().to_lowercase(),
                    })?;
            *conn = Some(stream);
        }
        let stream = conn.as_mut().ok_or_else(|| {
            RpcClientError::Protocol("connection vanished after connect".to_string())
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest { id, call };
        let body = to_body(&request).map_err(|e| RpcClientError::Send(e.to_string()))?;

        stream
            .write_all(&encode_frame(&body))
            .await
            .map_err(|e| RpcClientError::Send(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| RpcClientError::Send(e.to_string()))?;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|e| RpcClientError::Receive(e.to_string()))?;
        let body_len = decode_frame_length(&header)
            .ok_or_else(|| RpcClientError::Protocol("oversized reply frame".to_string()))?;

        let mut body = vec![0u8; body_len];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| RpcClientError::Receive(e.to_string()))?;

        let reply: RpcReply =
            from_body(&body).map_err(|e| RpcClientError::Protocol(e.to_string()))?;
        if reply.id != id {
            return Err(RpcClientError::Protocol(format!(
                "reply id {} does not match request id {id}",
                reply.id
            )));
        }

        Ok(reply.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::message::RpcResult;
    use crate::rpc::server::{RpcHandler, RpcServer};
    use crate::types::HealthCheckResp;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct HealthyHandler;

    #[async_trait]
    impl RpcHandler for HealthyHandler {
        async fn handle(&self, call: RpcCall) -> RpcResult {
            match call {
                RpcCall::HealthCheck => RpcResult::Health(HealthCheckResp {
                    status: "healthy".to_string(),
                    message: String::new(),
                    peer_count: 1,
                }),
                _ => RpcResult::Error("unexpected call".to_string()),
            }
        }
    }

    #[tokio::test]
    async fn test_call_over_persistent_connection() {
        let server = RpcServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr();
        let handle = server.spawn(Arc::new(HealthyHandler));

        let client = RpcClient::new(addr.to_string());
        for _ in 0..3 {
            let result = client
                .call(RpcCall::HealthCheck, Duration::from_secs(5))
                .await
                .unwrap();
            match result {
                RpcResult::Health(h) => assert_eq!(h.status, "healthy"),
                other => panic!("unexpected result: {other:?}"),
            }
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_error_mentions_refusal() {
        // A port nothing listens on.
        let client = RpcClient::new("127.0.0.1:1");
        let err = client
            .call(RpcCall::HealthCheck, Duration::from_secs(5))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("connection refused") || message.contains("access"),
            "unexpected error: {message}"
        );
    }
}
