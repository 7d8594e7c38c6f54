//! # stompview-protocol
//!
//! Payload and wire codecs for stompview.
//!
//! This crate provides:
//! - JSON payload decoding and snapshot/upsert classification
//! - The outbound request payload (`trader`, `bookOwners`, `requestId`)
//! - STOMP 1.2 text framing for the TCP transport
//! - Protocol error types

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder, Payload, Unrecognized};
pub use error::{DecodeError, ProtocolError};
pub use frame::{Command, Frame, FrameDecoder};
pub use message::{parse_csv, DataRequest, RequestPayload, JSON_CONTENT_TYPE};

/// STOMP protocol version spoken by the transport.
pub const STOMP_VERSION: &str = "1.2";

/// Default port for STOMP brokers.
pub const DEFAULT_PORT: u16 = 61613;

/// Maximum payload size accepted by the decoder (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of a single STOMP frame, headers included.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 64 * 1024;
