//! Dashboard Push Channel
//!
//! WebSocket client for `/api/v1/ws`: frame decoding, keepalive probing and
//! the reconnecting connection loop.

/// Push frame decoding.
pub mod codec;

/// Keepalive probing and timeout detection.
pub mod keepalive;

mod client;

pub use client::{KEEPALIVE_PROBE, PushClient, PushClientConfig, PushError};
pub use codec::{CodecError, PushCodec, PushFrame};
pub use keepalive::KeepaliveConfig;

/// Path of the push endpoint, relative to the WebSocket base URL.
pub const PUSH_PATH: &str = "/api/v1/ws";
