//! Client error types.

use crate::session::SessionState;
use stompview_protocol::ProtocolError;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("broker error: {message}")]
    Broker { message: String, details: String },

    #[error("unexpected {actual} frame, expected {expected}")]
    UnexpectedFrame {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Session errors surfaced to the caller of the session controller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already live (state: {0})")]
    AlreadyConnected(SessionState),

    #[error("no active session")]
    NotConnected,

    #[error("session not ready (state: {0})")]
    NotReady(SessionState),

    #[error("connect cancelled by disconnect")]
    Cancelled,

    #[error("session failed: {0}")]
    Failed(String),

    #[error("transport error: {0}")]
    Transport(#[from] ClientError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
