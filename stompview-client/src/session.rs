//! Session controller.
//!
//! Drives one STOMP session through connect, subscribe and request, and
//! routes every inbound frame of the live session into the reconciliation
//! store. At most one session is live at a time.
//!
//! Each connect starts a new *generation*. Inbound events for a generation
//! are drained by a dedicated pump task, and the pump checks generation and
//! state under the same lock it holds while applying the frame. A frame from
//! a superseded or closing session therefore never reaches the store.

use crate::error::{ClientError, SessionError};
use crate::transport::{EventSink, SessionHandle, Transport, TransportEvent};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stompview_core::{Record, ReconciliationStore};
use stompview_protocol::{DataRequest, Decoder, Encoder, Payload, JSON_CONTENT_TYPE};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Subscribing,
    Active,
    Closing,
    Failed,
}

impl SessionState {
    /// True while a session occupies the controller.
    pub fn is_live(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Failed)
    }

    /// Frames are applied only once the subscription is being set up.
    pub fn routes_frames(self) -> bool {
        matches!(self, SessionState::Subscribing | SessionState::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Subscribing => "Subscribing",
            SessionState::Active => "Active",
            SessionState::Closing => "Closing",
            SessionState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Observable session status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub generation: u64,
    /// Cause of the last failure, cleared on the next connect.
    pub last_error: Option<String>,
}

/// Destinations used by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Where request payloads are sent.
    pub send_destination: String,
    /// Where snapshots and upserts arrive.
    pub subscribe_destination: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_destination: "/app/request".to_string(),
            subscribe_destination: "/user/queue/response".to_string(),
        }
    }
}

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub generation: u64,
    /// `requestId` of the initial request.
    pub request_id: String,
}

/// What [`SessionController::submit_or_connect`] did with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Sent on the session that was already active.
    Sent { request_id: String },
    /// Opened a new session with the request as its initial request.
    Connected(ConnectOutcome),
}

impl SubmitOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            SubmitOutcome::Sent { request_id } => request_id,
            SubmitOutcome::Connected(outcome) => &outcome.request_id,
        }
    }
}

enum Route {
    Send(u64, SessionHandle),
    Connect(u64, EventSink),
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub frames_received: u64,
    pub frames_applied: u64,
    pub decode_errors: u64,
    pub unrecognized: u64,
    pub missing_identity: u64,
    pub skipped_elements: u64,
    pub stale_frames: u64,
    pub transport_errors: u64,
}

#[derive(Debug, Default)]
struct SessionStats {
    frames_received: AtomicU64,
    frames_applied: AtomicU64,
    decode_errors: AtomicU64,
    unrecognized: AtomicU64,
    missing_identity: AtomicU64,
    skipped_elements: AtomicU64,
    stale_frames: AtomicU64,
    transport_errors: AtomicU64,
}

impl SessionStats {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn counters(&self) -> SessionCounters {
        SessionCounters {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_applied: self.frames_applied.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unrecognized: self.unrecognized.load(Ordering::Relaxed),
            missing_identity: self.missing_identity.load(Ordering::Relaxed),
            skipped_elements: self.skipped_elements.load(Ordering::Relaxed),
            stale_frames: self.stale_frames.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

struct Gate {
    state: SessionState,
    generation: u64,
    handle: Option<SessionHandle>,
    last_error: Option<String>,
    pump: Option<JoinHandle<()>>,
}

struct Shared<T> {
    transport: T,
    store: Arc<ReconciliationStore<Value>>,
    config: SessionConfig,
    gate: Mutex<Gate>,
    status: watch::Sender<SessionStatus>,
    stats: SessionStats,
}

/// Owns the single live session and feeds its frames into the store.
pub struct SessionController<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> SessionController<T> {
    pub fn new(
        transport: T,
        store: Arc<ReconciliationStore<Value>>,
        config: SessionConfig,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: SessionState::Idle,
            generation: 0,
            last_error: None,
        });
        Self {
            shared: Arc::new(Shared {
                transport,
                store,
                config,
                gate: Mutex::new(Gate {
                    state: SessionState::Idle,
                    generation: 0,
                    handle: None,
                    last_error: None,
                    pump: None,
                }),
                status,
                stats: SessionStats::default(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<ReconciliationStore<Value>> {
        &self.shared.store
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.gate.lock().state
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    /// Receiver that observes every state transition.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    pub fn counters(&self) -> SessionCounters {
        self.shared.stats.counters()
    }

    /// Opens a session, subscribes, and sends the initial request.
    ///
    /// Fails with [`SessionError::AlreadyConnected`] while another session is
    /// live; that session is left untouched. The previous dataset is
    /// discarded when the new session claims the controller.
    pub async fn connect(
        &self,
        endpoint: &str,
        request: &DataRequest,
    ) -> Result<ConnectOutcome, SessionError> {
        let payload = request.to_payload();
        let body = Encoder::encode_request(&payload)?;
        let shared = &self.shared;

        let (generation, sink) = {
            let mut gate = shared.gate.lock();
            if gate.state.is_live() {
                debug!(state = %gate.state, "connect rejected: session already live");
                return Err(SessionError::AlreadyConnected(gate.state));
            }
            shared.claim(&mut gate)
        };

        shared
            .establish(endpoint, generation, sink, payload.request_id, body)
            .await
    }

    /// Sends another request on the active session. Returns its `requestId`.
    pub async fn submit(&self, request: &DataRequest) -> Result<String, SessionError> {
        let payload = request.to_payload();
        let body = Encoder::encode_request(&payload)?;
        let shared = &self.shared;

        let (generation, handle) = {
            let gate = shared.gate.lock();
            match (&gate.state, &gate.handle) {
                (SessionState::Active, Some(handle)) => (gate.generation, handle.clone()),
                _ => return Err(SessionError::NotConnected),
            }
        };

        shared.send_request(generation, &handle, body).await?;
        debug!(generation, request_id = %payload.request_id, "request sent");
        Ok(payload.request_id)
    }

    /// Sends a request, opening a session for it when none is live.
    ///
    /// On an `Idle` or `Failed` controller the request becomes the initial
    /// request of a new session. The state check and the claim happen under
    /// one lock, so concurrent callers never open two sessions. While a
    /// session is still being set up or torn down this fails with
    /// [`SessionError::NotReady`].
    pub async fn submit_or_connect(
        &self,
        endpoint: &str,
        request: &DataRequest,
    ) -> Result<SubmitOutcome, SessionError> {
        let payload = request.to_payload();
        let body = Encoder::encode_request(&payload)?;
        let shared = &self.shared;

        let route = {
            let mut gate = shared.gate.lock();
            let active = match (gate.state, &gate.handle) {
                (SessionState::Active, Some(handle)) => Some(handle.clone()),
                _ => None,
            };
            if let Some(handle) = active {
                Route::Send(gate.generation, handle)
            } else if gate.state.is_live() {
                return Err(SessionError::NotReady(gate.state));
            } else {
                debug!(state = %gate.state, "no live session, connecting for request");
                let (generation, sink) = shared.claim(&mut gate);
                Route::Connect(generation, sink)
            }
        };

        match route {
            Route::Send(generation, handle) => {
                shared.send_request(generation, &handle, body).await?;
                debug!(generation, request_id = %payload.request_id, "request sent");
                Ok(SubmitOutcome::Sent {
                    request_id: payload.request_id,
                })
            }
            Route::Connect(generation, sink) => shared
                .establish(endpoint, generation, sink, payload.request_id, body)
                .await
                .map(SubmitOutcome::Connected),
        }
    }

    /// Tears down the live session, if any.
    ///
    /// From the moment this is called no frame of the closing session is
    /// applied, including frames already queued. A connect still in progress
    /// is cancelled and returns [`SessionError::Cancelled`].
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let (generation, handle) = {
            let mut gate = shared.gate.lock();
            match gate.state {
                SessionState::Idle | SessionState::Failed | SessionState::Closing => {
                    debug!(state = %gate.state, "disconnect: no live session");
                    return Ok(());
                }
                _ => {}
            }
            shared.transition(&mut gate, SessionState::Closing);
            if let Some(pump) = gate.pump.take() {
                pump.abort();
            }
            (gate.generation, gate.handle.take())
        };

        if let Some(handle) = &handle {
            shared.release(handle).await;
        }

        let mut gate = shared.gate.lock();
        if gate.generation == generation && gate.state == SessionState::Closing {
            shared.transition(&mut gate, SessionState::Idle);
        }
        info!(generation, "disconnected");
        Ok(())
    }
}

impl<T: Transport> Drop for SessionController<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.shared.gate.lock().pump.take() {
            pump.abort();
        }
    }
}

impl<T: Transport> Shared<T> {
    /// Starts a new generation on a controller with no live session.
    ///
    /// Must be called with the gate held.
    fn claim(self: &Arc<Self>, gate: &mut Gate) -> (u64, EventSink) {
        gate.generation += 1;
        gate.handle = None;
        gate.last_error = None;
        self.transition(gate, SessionState::Connecting);
        self.store.clear();

        let (sink, rx) = EventSink::channel();
        let pump = tokio::spawn(pump(Arc::clone(self), gate.generation, rx));
        if let Some(old) = gate.pump.replace(pump) {
            old.abort();
        }
        (gate.generation, sink)
    }

    /// Connects, subscribes and sends `body` for a claimed generation.
    async fn establish(
        &self,
        endpoint: &str,
        generation: u64,
        sink: EventSink,
        request_id: String,
        body: Bytes,
    ) -> Result<ConnectOutcome, SessionError> {
        info!(endpoint, generation, "connecting");
        let handle = match self.transport.connect(endpoint, sink).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(generation, e).await),
        };

        if let Err(e) = self.advance(
            generation,
            SessionState::Connecting,
            SessionState::Connected,
            Some(handle.clone()),
        ) {
            self.release(&handle).await;
            return Err(e);
        }
        self.advance(generation, SessionState::Connected, SessionState::Subscribing, None)?;

        let subscribe_to = self.config.subscribe_destination.as_str();
        if let Err(e) = self.transport.subscribe(&handle, subscribe_to).await {
            return Err(self.fail(generation, e).await);
        }
        debug!(destination = subscribe_to, generation, "subscription acknowledged");

        self.ensure(generation, SessionState::Subscribing)?;
        self.send_request(generation, &handle, body).await?;

        self.advance(generation, SessionState::Subscribing, SessionState::Active, None)?;
        info!(generation, request_id = %request_id, "session active");

        Ok(ConnectOutcome {
            generation,
            request_id,
        })
    }

    async fn send_request(
        &self,
        generation: u64,
        handle: &SessionHandle,
        body: Bytes,
    ) -> Result<(), SessionError> {
        let send_to = self.config.send_destination.as_str();
        if let Err(e) = self
            .transport
            .send(handle, send_to, body, JSON_CONTENT_TYPE)
            .await
        {
            return Err(self.fail(generation, e).await);
        }
        Ok(())
    }

    /// Must be called with the gate held so observers see transitions in order.
    fn transition(&self, gate: &mut Gate, to: SessionState) {
        debug!(from = %gate.state, to = %to, generation = gate.generation, "session state");
        gate.state = to;
        self.status.send_replace(SessionStatus {
            state: to,
            generation: gate.generation,
            last_error: gate.last_error.clone(),
        });
    }

    /// Error for a connect whose session has moved on without it.
    fn superseded(gate: &Gate, generation: u64) -> SessionError {
        if gate.generation == generation && gate.state == SessionState::Failed {
            SessionError::Failed(gate.last_error.clone().unwrap_or_default())
        } else {
            SessionError::Cancelled
        }
    }

    fn ensure(&self, generation: u64, expected: SessionState) -> Result<(), SessionError> {
        let gate = self.gate.lock();
        if gate.generation == generation && gate.state == expected {
            Ok(())
        } else {
            Err(Self::superseded(&gate, generation))
        }
    }

    fn advance(
        &self,
        generation: u64,
        from: SessionState,
        to: SessionState,
        handle: Option<SessionHandle>,
    ) -> Result<(), SessionError> {
        let mut gate = self.gate.lock();
        if gate.generation != generation || gate.state != from {
            return Err(Self::superseded(&gate, generation));
        }
        if handle.is_some() {
            gate.handle = handle;
        }
        self.transition(&mut gate, to);
        Ok(())
    }

    /// Moves the session to `Failed` if `generation` is still live.
    ///
    /// Returns the handle to release, or the error to report when the
    /// session was already torn down.
    fn mark_failed(
        &self,
        generation: u64,
        cause: &ClientError,
    ) -> Result<Option<SessionHandle>, SessionError> {
        let mut gate = self.gate.lock();
        let live = matches!(
            gate.state,
            SessionState::Connecting
                | SessionState::Connected
                | SessionState::Subscribing
                | SessionState::Active
        );
        if gate.generation != generation || !live {
            debug!(generation, error = %cause, "ignoring error from inactive session");
            return Err(Self::superseded(&gate, generation));
        }

        SessionStats::bump(&self.stats.transport_errors, 1);
        error!(generation, state = %gate.state, error = %cause, "session failed");
        gate.last_error = Some(cause.to_string());
        let handle = gate.handle.take();
        self.transition(&mut gate, SessionState::Failed);
        Ok(handle)
    }

    async fn fail(&self, generation: u64, cause: ClientError) -> SessionError {
        match self.mark_failed(generation, &cause) {
            Ok(handle) => {
                if let Some(handle) = handle {
                    self.release(&handle).await;
                }
                SessionError::Transport(cause)
            }
            Err(e) => e,
        }
    }

    async fn release(&self, handle: &SessionHandle) {
        if let Err(e) = self.transport.disconnect(handle).await {
            warn!(session = handle.id, error = %e, "failed to release session");
        }
    }

    fn route_frame(&self, generation: u64, destination: &str, body: &[u8]) {
        SessionStats::bump(&self.stats.frames_received, 1);
        let decoded = Decoder::read(body);

        let gate = self.gate.lock();
        if gate.generation != generation || !gate.state.routes_frames() {
            SessionStats::bump(&self.stats.stale_frames, 1);
            debug!(
                generation,
                current = gate.generation,
                state = %gate.state,
                destination,
                "dropping frame from inactive session"
            );
            return;
        }

        match decoded {
            Ok(Payload::Snapshot { records, skipped }) => {
                if skipped > 0 {
                    SessionStats::bump(&self.stats.skipped_elements, skipped as u64);
                    warn!(skipped, destination, "skipped snapshot elements that are not objects");
                }
                let outcome = self
                    .store
                    .reset_with_snapshot(records.into_iter().map(Record::from).collect());
                SessionStats::bump(&self.stats.missing_identity, outcome.rejected as u64);
                SessionStats::bump(&self.stats.frames_applied, 1);
                info!(
                    rows = outcome.rows,
                    rejected = outcome.rejected,
                    "snapshot received"
                );
            }
            Ok(Payload::Upsert(map)) => match self.store.upsert(Record::from(map)) {
                Ok(_) => SessionStats::bump(&self.stats.frames_applied, 1),
                Err(_) => SessionStats::bump(&self.stats.missing_identity, 1),
            },
            Ok(Payload::Unrecognized(reason)) => {
                SessionStats::bump(&self.stats.unrecognized, 1);
                warn!(%reason, destination, "ignoring unrecognized payload");
            }
            Err(e) => {
                SessionStats::bump(&self.stats.decode_errors, 1);
                warn!(error = %e, destination, bytes = body.len(), "failed to decode payload");
            }
        }
    }
}

/// Drains the inbound queue of one generation.
async fn pump<T: Transport>(
    shared: Arc<Shared<T>>,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Connected(handle) => {
                debug!(generation, session = handle.id, "transport connected");
            }
            TransportEvent::Frame { destination, body } => {
                shared.route_frame(generation, &destination, &body);
            }
            TransportEvent::Error(cause) => {
                let _ = shared.fail(generation, cause).await;
                break;
            }
        }
    }
    debug!(generation, "event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use stompview_core::StoreConfig;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    const ENDPOINT: &str = "tcp://localhost:61613";

    #[derive(Default)]
    struct MockTransport {
        next_id: AtomicU64,
        sinks: SyncMutex<Vec<EventSink>>,
        subscriptions: SyncMutex<Vec<String>>,
        sent: SyncMutex<Vec<(String, Bytes, String)>>,
        released: SyncMutex<Vec<SessionHandle>>,
        hold_connect: Option<Arc<Notify>>,
        fail_connect: AtomicBool,
        fail_subscribe: AtomicBool,
        fail_send: AtomicBool,
    }

    impl Transport for MockTransport {
        async fn connect(
            &self,
            _endpoint: &str,
            events: EventSink,
        ) -> Result<SessionHandle, ClientError> {
            if let Some(gate) = &self.hold_connect {
                gate.notified().await;
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(ClientError::ConnectionClosed);
            }
            let handle = SessionHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            events.on_connected(handle.clone());
            self.sinks.lock().push(events);
            Ok(handle)
        }

        async fn subscribe(
            &self,
            _handle: &SessionHandle,
            destination: &str,
        ) -> Result<(), ClientError> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(ClientError::Timeout);
            }
            self.subscriptions.lock().push(destination.to_string());
            Ok(())
        }

        async fn send(
            &self,
            _handle: &SessionHandle,
            destination: &str,
            body: Bytes,
            content_type: &str,
        ) -> Result<(), ClientError> {
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "broken pipe",
                )));
            }
            self.sent
                .lock()
                .push((destination.to_string(), body, content_type.to_string()));
            Ok(())
        }

        async fn disconnect(&self, handle: &SessionHandle) -> Result<(), ClientError> {
            self.released.lock().push(handle.clone());
            Ok(())
        }
    }

    fn controller(transport: MockTransport) -> SessionController<MockTransport> {
        let store = Arc::new(ReconciliationStore::new(StoreConfig::default()));
        SessionController::new(transport, store, SessionConfig::default())
    }

    fn request() -> DataRequest {
        DataRequest::from_input("TRADER001", "OWNER001, OWNER002")
    }

    fn sink(controller: &SessionController<MockTransport>, index: usize) -> EventSink {
        controller.transport().sinks.lock()[index].clone()
    }

    fn frame(sink: &EventSink, body: &'static str) {
        sink.on_frame("/user/queue/response", Bytes::from_static(body.as_bytes()));
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_connect_reaches_active_and_sends_request() {
        let controller = controller(MockTransport::default());
        let outcome = assert_ok!(controller.connect(ENDPOINT, &request()).await);

        assert_eq!(outcome.generation, 1);
        assert_eq!(controller.state(), SessionState::Active);
        assert_eq!(
            *controller.transport().subscriptions.lock(),
            vec!["/user/queue/response".to_string()]
        );

        let sent = controller.transport().sent.lock();
        assert_eq!(sent.len(), 1);
        let (destination, body, content_type) = &sent[0];
        assert_eq!(destination, "/app/request");
        assert_eq!(content_type, JSON_CONTENT_TYPE);
        let json: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["trader"], "TRADER001");
        assert_eq!(json["bookOwners"], serde_json::json!(["OWNER001", "OWNER002"]));
        assert_eq!(json["requestId"], outcome.request_id.as_str());
    }

    #[tokio::test]
    async fn test_snapshot_then_upsert_reach_store() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.connect(ENDPOINT, &request()).await);

        let events = sink(&controller, 0);
        frame(&events, r#"[{"id":1,"a":"x"},{"id":2,"a":"y"}]"#);
        frame(&events, r#"{"id":2,"b":true}"#);
        wait_until(|| controller.counters().frames_applied == 2).await;

        let snapshot = controller.store().snapshot();
        assert_eq!(snapshot.schema.columns(), ["id", "a", "b"]);
        assert_eq!(snapshot.rows.len(), 2);
        assert_eq!(snapshot.get(1, "a"), Some(&serde_json::json!("y")));
        assert_eq!(snapshot.get(1, "b"), Some(&serde_json::json!(true)));
        assert_eq!(snapshot.get(0, "b"), None);
    }

    #[tokio::test]
    async fn test_second_connect_rejected_while_active() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.connect(ENDPOINT, &request()).await);

        let err = assert_err!(controller.connect(ENDPOINT, &request()).await);
        assert!(matches!(err, SessionError::AlreadyConnected(SessionState::Active)));
        assert_eq!(controller.state(), SessionState::Active);
        assert_eq!(controller.transport().sent.lock().len(), 1);
        assert!(controller.transport().released.lock().is_empty());
        assert_eq!(controller.status().generation, 1);
    }

    #[tokio::test]
    async fn test_second_connect_rejected_while_connecting() {
        let notify = Arc::new(Notify::new());
        let transport = MockTransport {
            hold_connect: Some(Arc::clone(&notify)),
            ..Default::default()
        };
        let controller = Arc::new(controller(transport));

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                let request = request();
                controller.connect(ENDPOINT, &request).await
            })
        };
        wait_until(|| controller.state() == SessionState::Connecting).await;

        let err = assert_err!(controller.connect(ENDPOINT, &request()).await);
        assert!(matches!(err, SessionError::AlreadyConnected(SessionState::Connecting)));

        notify.notify_one();
        assert_ok!(first.await.unwrap());
        assert_eq!(controller.state(), SessionState::Active);
        assert_eq!(controller.transport().sinks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let notify = Arc::new(Notify::new());
        let transport = MockTransport {
            hold_connect: Some(Arc::clone(&notify)),
            ..Default::default()
        };
        let controller = Arc::new(controller(transport));

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                let request = request();
                controller.connect(ENDPOINT, &request).await
            })
        };
        wait_until(|| controller.state() == SessionState::Connecting).await;

        assert_ok!(controller.disconnect().await);
        assert_eq!(controller.state(), SessionState::Idle);

        notify.notify_one();
        let err = assert_err!(first.await.unwrap());
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(controller.state(), SessionState::Idle);
        // The late handle is released, nothing was subscribed
        assert_eq!(controller.transport().released.lock().len(), 1);
        assert!(controller.transport().subscriptions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_frames_after_disconnect_are_not_applied() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.connect(ENDPOINT, &request()).await);

        let events = sink(&controller, 0);
        frame(&events, r#"[{"id":1}]"#);
        assert_ok!(controller.disconnect().await);
        frame(&events, r#"{"id":2}"#);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(controller.store().is_empty());
        assert_eq!(controller.counters().frames_applied, 0);
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(controller.transport().released.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_frame_dropped() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.connect(ENDPOINT, &request()).await);
        assert_ok!(controller.disconnect().await);
        let outcome = assert_ok!(controller.connect(ENDPOINT, &request()).await);
        assert_eq!(outcome.generation, 2);

        // A late frame tagged with the first generation
        controller
            .shared
            .route_frame(1, "/user/queue/response", br#"[{"id":"stale"}]"#);
        assert_eq!(controller.counters().stale_frames, 1);
        assert!(controller.store().is_empty());

        frame(&sink(&controller, 1), r#"[{"id":"fresh"}]"#);
        wait_until(|| controller.counters().frames_applied == 1).await;
        let snapshot = controller.store().snapshot();
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.get(0, "id"), Some(&serde_json::json!("fresh")));
    }

    #[tokio::test]
    async fn test_connect_discards_previous_dataset() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.connect(ENDPOINT, &request()).await);
        frame(&sink(&controller, 0), r#"[{"id":1},{"id":2}]"#);
        wait_until(|| controller.store().len() == 2).await;

        assert_ok!(controller.disconnect().await);
        assert_eq!(controller.store().len(), 2);

        assert_ok!(controller.connect(ENDPOINT, &request()).await);
        assert!(controller.store().is_empty());
        assert!(controller.store().current_schema().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_fails_session() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.connect(ENDPOINT, &request()).await);

        sink(&controller, 0).on_transport_error(ClientError::ConnectionClosed);
        wait_until(|| controller.state() == SessionState::Failed).await;

        let status = controller.status();
        assert_eq!(status.last_error.as_deref(), Some("connection closed"));
        assert_eq!(controller.counters().transport_errors, 1);
        assert_eq!(controller.transport().released.lock().len(), 1);

        // Failed frees the slot for a new session
        let outcome = assert_ok!(controller.connect(ENDPOINT, &request()).await);
        assert_eq!(outcome.generation, 2);
        assert_eq!(controller.status().last_error, None);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_cause() {
        let transport = MockTransport::default();
        transport.fail_connect.store(true, Ordering::SeqCst);
        let controller = controller(transport);

        let err = assert_err!(controller.connect(ENDPOINT, &request()).await);
        assert!(matches!(err, SessionError::Transport(ClientError::ConnectionClosed)));
        assert_eq!(controller.state(), SessionState::Failed);
        assert_eq!(controller.counters().transport_errors, 1);
    }

    #[tokio::test]
    async fn test_subscribe_failure_fails_session() {
        let transport = MockTransport::default();
        transport.fail_subscribe.store(true, Ordering::SeqCst);
        let controller = controller(transport);

        let err = assert_err!(controller.connect(ENDPOINT, &request()).await);
        assert!(matches!(err, SessionError::Transport(ClientError::Timeout)));
        assert_eq!(controller.state(), SessionState::Failed);
        assert_eq!(controller.status().last_error.as_deref(), Some("request timeout"));
        assert_eq!(controller.counters().transport_errors, 1);
        assert_eq!(controller.transport().released.lock().len(), 1);
        assert!(controller.transport().sent.lock().is_empty());

        // A frame that raced the failure is not applied
        frame(&sink(&controller, 0), r#"[{"id":1}]"#);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(controller.store().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_frames_are_counted() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.connect(ENDPOINT, &request()).await);

        let events = sink(&controller, 0);
        frame(&events, "42");
        frame(&events, "   ");
        frame(&events, "{bad");
        frame(&events, "[1,2]");
        frame(&events, r#"{"name":"no id"}"#);
        frame(&events, r#"[{"id":1},"x",{"id":null}]"#);
        wait_until(|| controller.counters().frames_received == 6).await;

        let counters = controller.counters();
        assert_eq!(counters.unrecognized, 3);
        assert_eq!(counters.decode_errors, 1);
        assert_eq!(counters.missing_identity, 2);
        assert_eq!(counters.skipped_elements, 1);
        assert_eq!(counters.frames_applied, 1);
        assert_eq!(controller.store().len(), 1);
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_submit_requires_active_session() {
        let controller = controller(MockTransport::default());
        let err = assert_err!(controller.submit(&request()).await);
        assert!(matches!(err, SessionError::NotConnected));

        let outcome = assert_ok!(controller.connect(ENDPOINT, &request()).await);
        let request_id = assert_ok!(controller.submit(&request()).await);
        assert_ne!(request_id, outcome.request_id);
        assert_eq!(controller.transport().sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_submit_failure_fails_session() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.connect(ENDPOINT, &request()).await);
        controller.transport().fail_send.store(true, Ordering::SeqCst);

        let err = assert_err!(controller.submit(&request()).await);
        assert!(matches!(err, SessionError::Transport(ClientError::Io(_))));
        assert_eq!(controller.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_submit_or_connect_opens_session_when_idle() {
        let controller = controller(MockTransport::default());

        let outcome = assert_ok!(controller.submit_or_connect(ENDPOINT, &request()).await);
        let SubmitOutcome::Connected(connected) = &outcome else {
            panic!("expected a new session, got {:?}", outcome);
        };
        assert_eq!(connected.generation, 1);
        assert_eq!(controller.state(), SessionState::Active);
        assert_eq!(controller.transport().sinks.lock().len(), 1);

        // The second request reuses the live session
        let outcome = assert_ok!(controller.submit_or_connect(ENDPOINT, &request()).await);
        assert!(matches!(outcome, SubmitOutcome::Sent { .. }));
        assert_eq!(controller.transport().sinks.lock().len(), 1);

        let sent = controller.transport().sent.lock();
        assert_eq!(sent.len(), 2);
        let json: Value = serde_json::from_slice(&sent[1].1).unwrap();
        assert_eq!(json["requestId"], outcome.request_id());
    }

    #[tokio::test]
    async fn test_submit_or_connect_reconnects_after_failure() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.connect(ENDPOINT, &request()).await);
        sink(&controller, 0).on_transport_error(ClientError::ConnectionClosed);
        wait_until(|| controller.state() == SessionState::Failed).await;

        let outcome = assert_ok!(controller.submit_or_connect(ENDPOINT, &request()).await);
        assert!(matches!(outcome, SubmitOutcome::Connected(ConnectOutcome { generation: 2, .. })));
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_submit_or_connect_waits_for_pending_connect() {
        let notify = Arc::new(Notify::new());
        let transport = MockTransport {
            hold_connect: Some(Arc::clone(&notify)),
            ..Default::default()
        };
        let controller = Arc::new(controller(transport));

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                let request = request();
                controller.submit_or_connect(ENDPOINT, &request).await
            })
        };
        wait_until(|| controller.state() == SessionState::Connecting).await;

        let err = assert_err!(controller.submit_or_connect(ENDPOINT, &request()).await);
        assert!(matches!(err, SessionError::NotReady(SessionState::Connecting)));

        notify.notify_one();
        let outcome = assert_ok!(first.await.unwrap());
        assert!(matches!(outcome, SubmitOutcome::Connected(_)));
        assert_eq!(controller.status().generation, 1);
        assert_eq!(controller.transport().sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let controller = controller(MockTransport::default());
        assert_ok!(controller.disconnect().await);
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.transport().released.lock().is_empty());
    }

    #[tokio::test]
    async fn test_watch_status_observes_transitions() {
        let controller = controller(MockTransport::default());
        let mut status = controller.watch_status();
        assert_eq!(status.borrow().state, SessionState::Idle);

        assert_ok!(controller.connect(ENDPOINT, &request()).await);
        assert!(status.has_changed().unwrap());
        let current = status.borrow_and_update().clone();
        assert_eq!(current.state, SessionState::Active);
        assert_eq!(current.generation, 1);

        assert_ok!(controller.disconnect().await);
        assert_eq!(status.borrow().state, SessionState::Idle);
    }

    #[test]
    fn test_state_predicates() {
        assert!(!SessionState::Idle.is_live());
        assert!(!SessionState::Failed.is_live());
        assert!(SessionState::Closing.is_live());
        assert!(SessionState::Subscribing.routes_frames());
        assert!(SessionState::Active.routes_frames());
        assert!(!SessionState::Connected.routes_frames());
        assert!(!SessionState::Closing.routes_frames());
    }
}
