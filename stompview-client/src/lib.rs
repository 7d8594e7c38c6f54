//! # stompview-client
//!
//! Session layer for stompview.
//!
//! This crate provides:
//! - The abstract `Transport` contract and its inbound event queue
//! - `SessionController`: the connect/subscribe/send/disconnect state machine
//!   that routes inbound frames into a `ReconciliationStore`
//! - `StompTransport`: STOMP 1.2 over TCP
//! - Layered configuration (defaults, YAML, environment)

pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod transport;

pub use config::{Config, ConfigError};
pub use connection::{StompConfig, StompTransport};
pub use error::{ClientError, SessionError};
pub use session::{
    ConnectOutcome, SessionConfig, SessionController, SessionCounters, SessionState,
    SessionStatus, SubmitOutcome,
};
pub use transport::{EventSink, SessionHandle, Transport, TransportEvent};
