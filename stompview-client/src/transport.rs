//! Abstract transport contract.
//!
//! A transport opens sessions and performs subscribe/send/disconnect on
//! behalf of the session controller. Inbound events travel the other way
//! through an [`EventSink`]: the transport posts immutable events into an
//! unbounded single-consumer queue owned by the controller, so delivery never
//! blocks on reconciliation work.

use crate::error::ClientError;
use bytes::Bytes;
use std::future::Future;
use tokio::sync::mpsc;

/// Identifies an open transport session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    /// Transport-local session number.
    pub id: u64,
    /// Session identifier reported by the broker, if any.
    pub server_session: Option<String>,
}

impl SessionHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            server_session: None,
        }
    }

    pub fn with_server_session(mut self, session: impl Into<String>) -> Self {
        self.server_session = Some(session.into());
        self
    }
}

/// Events delivered by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    Connected(SessionHandle),
    Frame { destination: String, body: Bytes },
    Error(ClientError),
}

/// Sending side of the inbound event queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx }
    }

    /// Creates a sink and the receiver the controller drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn on_connected(&self, handle: SessionHandle) {
        self.post(TransportEvent::Connected(handle));
    }

    pub fn on_frame(&self, destination: impl Into<String>, body: Bytes) {
        self.post(TransportEvent::Frame {
            destination: destination.into(),
            body,
        });
    }

    pub fn on_transport_error(&self, cause: ClientError) {
        self.post(TransportEvent::Error(cause));
    }

    /// True once the controller stopped listening to this session.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn post(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event sink closed, dropping transport event");
        }
    }
}

/// Outbound transport contract.
///
/// All methods may suspend the caller; none of them may block frame
/// delivery through the [`EventSink`] handed to `connect`.
pub trait Transport: Send + Sync + 'static {
    /// Opens a session. Inbound frames and errors for it go to `events`.
    fn connect(
        &self,
        endpoint: &str,
        events: EventSink,
    ) -> impl Future<Output = Result<SessionHandle, ClientError>> + Send;

    /// Subscribes to a destination. Resolves once the broker acknowledged
    /// the subscription, or immediately if the transport has no ack.
    fn subscribe(
        &self,
        handle: &SessionHandle,
        destination: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Sends a message body to a destination.
    fn send(
        &self,
        handle: &SessionHandle,
        destination: &str,
        body: Bytes,
        content_type: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Releases the session.
    fn disconnect(&self, handle: &SessionHandle)
        -> impl Future<Output = Result<(), ClientError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_posts_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.on_connected(SessionHandle::new(1).with_server_session("s-1"));
        sink.on_frame("/q", Bytes::from_static(b"[]"));
        sink.on_transport_error(ClientError::ConnectionClosed);

        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Connected(h)) if h.id == 1));
        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::Frame { destination, .. }) if destination == "/q"
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::Error(ClientError::ConnectionClosed))
        ));
    }

    #[test]
    fn test_sink_closed_after_receiver_dropped() {
        let (sink, rx) = EventSink::channel();
        assert!(!sink.is_closed());
        drop(rx);
        assert!(sink.is_closed());
        // Posting to a closed sink is a no-op
        sink.on_frame("/q", Bytes::new());
    }
}
