//! Binary framed RPC between peers.
//!
//! The wire format is a 4-byte big-endian length prefix followed by a
//! MessagePack body, carried over persistent TCP connections. See
//! [`message`] for the envelope, [`server`] for the accept loop and
//! [`client`] for the self-healing outbound side.

mod client;
mod message;
mod server;

pub use client::{RpcClient, RpcClientError, RpcClientResult};
pub use message::{
    decode_frame_length, encode_frame, from_body, to_body, RpcCall, RpcReply, RpcRequest,
    RpcResult, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::{RpcHandler, RpcServer, RpcServerHandle};
