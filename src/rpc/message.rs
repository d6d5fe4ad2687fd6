//! Peer RPC message types and framing.
//!
//! Messages travel over a persistent TCP connection as MessagePack bodies
//! behind a 4-byte big-endian length prefix. Requests and replies carry an
//! id so the client can detect a desynchronized stream.

use serde::{Deserialize, Serialize};

use crate::types::{GetRateLimitsReq, GetRateLimitsResp, HealthCheckResp, UpdatePeerGlobalsReq};

/// Frame header size: a big-endian `u32` body length.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum message size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// The operations a peer can be asked to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcCall {
    /// Main entry: route each request to its owner and answer in order.
    GetRateLimits(GetRateLimitsReq),
    /// Peer-to-peer entry: evaluate locally, no re-routing.
    GetPeerRateLimits(GetRateLimitsReq),
    /// Owner-to-peer broadcast of authoritative global counters.
    UpdatePeerGlobals(UpdatePeerGlobalsReq),
    /// Liveness and peer-client health.
    HealthCheck,
}

impl RpcCall {
    /// Operation name, as used in logs and the HTTP gateway paths.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RpcCall::GetRateLimits(_) => "GetRateLimits",
            RpcCall::GetPeerRateLimits(_) => "GetPeerRateLimits",
            RpcCall::UpdatePeerGlobals(_) => "UpdatePeerGlobals",
            RpcCall::HealthCheck => "HealthCheck",
        }
    }
}

/// Result of an [`RpcCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResult {
    /// Responses for `GetRateLimits` / `GetPeerRateLimits`.
    RateLimits(GetRateLimitsResp),
    /// Acknowledgement for `UpdatePeerGlobals`.
    Updated,
    /// Response for `HealthCheck`.
    Health(HealthCheckResp),
    /// Top-level failure: deadline exceeded, internal invariant violation,
    /// or a malformed call.
    Error(String),
}

/// A framed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id, echoed in the reply.
    pub id: u64,
    /// The operation to perform.
    pub call: RpcCall,
}

/// A framed reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    /// Correlation id from the request.
    pub id: u64,
    /// Outcome of the call.
    pub result: RpcResult,
}

/// Serialize a value to a MessagePack body.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_body<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(value)
}

/// Deserialize a value from a MessagePack body.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn from_body<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

/// Encode a body with its length prefix.
#[must_use]
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let len = body.len() as u32;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Decode the body length from a frame header.
///
/// Returns `None` when the advertised length exceeds [`MAX_MESSAGE_SIZE`].
#[must_use]
pub fn decode_frame_length(header: &[u8; FRAME_HEADER_SIZE]) -> Option<usize> {
    let len = u32::from_be_bytes(*header) as usize;
    if len <= MAX_MESSAGE_SIZE {
        Some(len)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RateLimitReq;

    #[test]
    fn test_request_roundtrip() {
        let req = RpcRequest {
            id: 7,
            call: RpcCall::GetPeerRateLimits(GetRateLimitsReq {
                requests: vec![RateLimitReq {
                    name: "test".to_string(),
                    unique_key: "account:1".to_string(),
                    hits: 1,
                    limit: 10,
                    duration: 1_000,
                    ..Default::default()
                }],
            }),
        };

        let body = to_body(&req).unwrap();
        let decoded: RpcRequest = from_body(&body).unwrap();
        assert_eq!(decoded.id, 7);
        match decoded.call {
            RpcCall::GetPeerRateLimits(inner) => {
                assert_eq!(inner.requests.len(), 1);
                assert_eq!(inner.requests[0].limit, 10);
            }
            other => panic!("wrong call: {other:?}"),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let body = b"hello world";
        let frame = encode_frame(body);
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + body.len());

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        assert_eq!(decode_frame_length(&header), Some(body.len()));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        assert_eq!(decode_frame_length(&len), None);
    }

    #[test]
    fn test_call_names() {
        assert_eq!(RpcCall::HealthCheck.name(), "HealthCheck");
        assert_eq!(
            RpcCall::GetRateLimits(GetRateLimitsReq::default()).name(),
            "GetRateLimits"
        );
    }
}
