//! STOMP 1.2 transport over TCP.

use crate::error::ClientError;
use crate::transport::{EventSink, SessionHandle, Transport};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stompview_protocol::frame::HEARTBEAT;
use stompview_protocol::{Command, Frame, FrameDecoder, DEFAULT_PORT, STOMP_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct StompConfig {
    /// TCP connect plus CONNECTED handshake.
    pub connect_timeout: Duration,
    /// How long to wait for a RECEIPT.
    pub receipt_timeout: Duration,
    /// Outgoing heart-beat interval we offer, in milliseconds. 0 disables.
    pub heartbeat_send_ms: u64,
    /// Incoming heart-beat interval we ask for, in milliseconds. 0 disables.
    pub heartbeat_recv_ms: u64,
    /// Virtual host for the `host` header (defaults to the endpoint host).
    pub virtual_host: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl Default for StompConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            receipt_timeout: Duration::from_secs(10),
            heartbeat_send_ms: 10_000,
            heartbeat_recv_ms: 10_000,
            virtual_host: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl StompConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, send_ms: u64, recv_ms: u64) -> Self {
        self.heartbeat_send_ms = send_ms;
        self.heartbeat_recv_ms = recv_ms;
        self
    }

    pub fn with_virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = Some(host.into());
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// Splits `tcp://host:port`, `stomp://host:port` or `host:port`.
///
/// The port defaults to 61613.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ClientError> {
    let invalid = || ClientError::InvalidEndpoint(endpoint.to_string());

    let rest = match endpoint.split_once("://") {
        Some(("tcp" | "stomp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(ClientError::InvalidEndpoint(format!(
                "unsupported scheme '{}' in {}",
                scheme, endpoint
            )))
        }
        None => endpoint,
    };
    let authority = rest.trim_end_matches('/');
    if authority.is_empty() || authority.contains('/') {
        return Err(invalid());
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(invalid()),
        None => Ok((authority.to_string(), DEFAULT_PORT)),
    }
}

/// Interval at which we must send heart-beats, given our offer and the
/// server's `heart-beat` header (`sx,sy`).
fn negotiate(ours: u64, theirs: Option<u64>) -> Option<Duration> {
    match theirs {
        Some(theirs) if ours > 0 && theirs > 0 => Some(Duration::from_millis(ours.max(theirs))),
        _ => None,
    }
}

fn parse_heartbeat(header: Option<&str>) -> (Option<u64>, Option<u64>) {
    let Some((sx, sy)) = header.and_then(|h| h.split_once(',')) else {
        return (None, None);
    };
    (sx.trim().parse().ok(), sy.trim().parse().ok())
}

fn broker_error(frame: &Frame) -> ClientError {
    ClientError::Broker {
        message: frame.header("message").unwrap_or("unspecified").to_string(),
        details: String::from_utf8_lossy(&frame.body).into_owned(),
    }
}

/// One open STOMP connection.
struct StompConnection {
    id: u64,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Receipts we are waiting for, keyed by receipt id.
    pending: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    next_id: AtomicU64,
    /// Set when we started tearing the session down.
    closing: AtomicBool,
    /// Set when the read side ended.
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    receipt_timeout: Duration,
}

impl StompConnection {
    fn new(id: u64, writer: OwnedWriteHalf, receipt_timeout: Duration) -> Self {
        Self {
            id,
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            receipt_timeout,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionClosed);
        }
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(bytes).await.map_err(ClientError::Io)
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        let encoded = frame.encode()?;
        tracing::trace!(
            "Sending {} frame ({} bytes)",
            frame.command.as_str(),
            encoded.len()
        );
        self.write_bytes(&encoded).await
    }

    /// Sends a frame with a `receipt` header and waits for the RECEIPT.
    async fn request_receipt(&self, frame: Frame) -> Result<Frame, ClientError> {
        let receipt_id = format!("rcpt-{}-{}", self.id, self.next_id());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(receipt_id.clone(), tx);

        // The read loop clears waiters once it ends; don't wait on a dead stream
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().remove(&receipt_id);
            return Err(ClientError::ConnectionClosed);
        }

        let frame = frame.with_header("receipt", receipt_id.as_str());
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().remove(&receipt_id);
            return Err(e);
        }

        tokio::time::timeout(self.receipt_timeout, rx)
            .await
            .map_err(|_| {
                tracing::debug!("Receipt {} timed out", receipt_id);
                self.pending.lock().remove(&receipt_id);
                ClientError::Timeout
            })?
            .map_err(|_| {
                tracing::debug!("Receipt {} channel closed", receipt_id);
                ClientError::ConnectionClosed
            })
    }

    /// Drops all receipt waiters; they observe `ConnectionClosed`.
    fn fail_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            tracing::debug!("Clearing {} pending receipts", pending.len());
        }
        pending.clear();
    }

    fn dispatch(&self, frame: Frame, events: &EventSink) -> Result<(), ClientError> {
        match frame.command {
            Command::Message => {
                let destination = frame.header("destination").unwrap_or_default().to_string();
                tracing::trace!(
                    "MESSAGE on {} ({} bytes)",
                    destination,
                    frame.body.len()
                );
                events.on_frame(destination, frame.body);
            }
            Command::Receipt => {
                let Some(receipt_id) = frame.header("receipt-id").map(str::to_string) else {
                    tracing::warn!("RECEIPT frame without receipt-id");
                    return Ok(());
                };
                match self.pending.lock().remove(&receipt_id) {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => tracing::debug!("No pending receipt for id={}", receipt_id),
                }
            }
            Command::Error => return Err(broker_error(&frame)),
            other => tracing::warn!("Ignoring unexpected {} frame", other.as_str()),
        }
        Ok(())
    }

    /// Reads and dispatches frames until the stream fails or closes.
    async fn pump_frames(
        &self,
        reader: &mut OwnedReadHalf,
        buf: &mut BytesMut,
        events: &EventSink,
        silence: Option<Duration>,
        buffer_size: usize,
    ) -> Result<(), ClientError> {
        let mut decoder = FrameDecoder::new();
        loop {
            while let Some(frame) = decoder.decode(buf)? {
                self.dispatch(frame, events)?;
            }

            buf.reserve(buffer_size);
            let n = match silence {
                Some(limit) => tokio::time::timeout(limit, reader.read_buf(buf))
                    .await
                    .map_err(|_| {
                        tracing::debug!("No data from server within {:?}", limit);
                        ClientError::Timeout
                    })??,
                None => reader.read_buf(buf).await?,
            };

            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            tracing::debug!("Shutting down writer");
            let _ = writer.shutdown().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.fail_pending();
    }
}

/// Reads one frame, used for the handshake before the read loop runs.
async fn read_frame(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    buffer_size: usize,
) -> Result<Frame, ClientError> {
    let mut decoder = FrameDecoder::new();
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            return Ok(frame);
        }
        buf.reserve(buffer_size);
        if reader.read_buf(buf).await? == 0 {
            return Err(ClientError::ConnectionClosed);
        }
    }
}

async fn read_loop(
    conn: Arc<StompConnection>,
    mut reader: OwnedReadHalf,
    mut buf: BytesMut,
    events: EventSink,
    silence: Option<Duration>,
    buffer_size: usize,
) {
    tracing::debug!("read_loop started for session {}", conn.id);
    let result = conn
        .pump_frames(&mut reader, &mut buf, &events, silence, buffer_size)
        .await;
    conn.closed.store(true, Ordering::SeqCst);
    conn.fail_pending();

    if conn.closing.load(Ordering::SeqCst) {
        tracing::debug!("read_loop for session {} stopped", conn.id);
        return;
    }
    let cause = match result {
        Ok(()) => ClientError::ConnectionClosed,
        Err(e) => e,
    };
    tracing::error!("Session {} transport error: {}", conn.id, cause);
    events.on_transport_error(cause);
}

async fn heartbeat_loop(conn: Arc<StompConnection>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = conn.write_bytes(HEARTBEAT).await {
            tracing::debug!("Heart-beat for session {} stopped: {}", conn.id, e);
            return;
        }
    }
}

/// STOMP over TCP.
pub struct StompTransport {
    config: StompConfig,
    connections: Mutex<HashMap<u64, Arc<StompConnection>>>,
    next_session: AtomicU64,
}

impl StompTransport {
    pub fn new(config: StompConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &StompConfig {
        &self.config
    }

    /// Number of sessions not yet released.
    pub fn open_sessions(&self) -> usize {
        self.connections.lock().len()
    }

    fn connection(&self, handle: &SessionHandle) -> Result<Arc<StompConnection>, ClientError> {
        self.connections
            .lock()
            .get(&handle.id)
            .cloned()
            .ok_or(ClientError::NotConnected)
    }

    async fn open(&self, endpoint: &str, events: EventSink) -> Result<SessionHandle, ClientError> {
        let (host, port) = parse_endpoint(endpoint)?;
        tracing::debug!("Connecting to {}:{}...", host, port);

        let stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true).ok();
        let (mut reader, writer) = stream.into_split();

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(StompConnection::new(id, writer, self.config.receipt_timeout));

        let virtual_host = self.config.virtual_host.as_deref().unwrap_or(&host);
        let connect = Frame::new(Command::Connect)
            .with_header("accept-version", STOMP_VERSION)
            .with_header("host", virtual_host)
            .with_header(
                "heart-beat",
                format!(
                    "{},{}",
                    self.config.heartbeat_send_ms, self.config.heartbeat_recv_ms
                ),
            );
        conn.write_frame(&connect).await?;

        let buffer_size = self.config.read_buffer_size;
        let mut buf = BytesMut::with_capacity(buffer_size);
        let reply = read_frame(&mut reader, &mut buf, buffer_size).await?;
        match reply.command {
            Command::Connected => {}
            Command::Error => return Err(broker_error(&reply)),
            other => {
                return Err(ClientError::UnexpectedFrame {
                    expected: "CONNECTED",
                    actual: other.as_str(),
                })
            }
        }

        let (server_send, server_recv) = parse_heartbeat(reply.header("heart-beat"));
        let send_every = negotiate(self.config.heartbeat_send_ms, server_recv);
        // Allow twice the negotiated receive interval before giving up
        let silence = negotiate(self.config.heartbeat_recv_ms, server_send).map(|d| d * 2);
        tracing::debug!(
            "CONNECTED version={} heart-beat send={:?} silence={:?}",
            reply.header("version").unwrap_or("?"),
            send_every,
            silence
        );

        let mut handle = SessionHandle::new(id);
        if let Some(session) = reply.header("session") {
            handle = handle.with_server_session(session);
        }

        {
            let mut tasks = conn.tasks.lock();
            tasks.push(tokio::spawn(read_loop(
                Arc::clone(&conn),
                reader,
                buf,
                events.clone(),
                silence,
                buffer_size,
            )));
            if let Some(interval) = send_every {
                tasks.push(tokio::spawn(heartbeat_loop(Arc::clone(&conn), interval)));
            }
        }

        self.connections.lock().insert(id, conn);
        events.on_connected(handle.clone());
        Ok(handle)
    }
}

impl Default for StompTransport {
    fn default() -> Self {
        Self::new(StompConfig::default())
    }
}

impl Transport for StompTransport {
    async fn connect(
        &self,
        endpoint: &str,
        events: EventSink,
    ) -> Result<SessionHandle, ClientError> {
        tokio::time::timeout(self.config.connect_timeout, self.open(endpoint, events))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })?
    }

    async fn subscribe(
        &self,
        handle: &SessionHandle,
        destination: &str,
    ) -> Result<(), ClientError> {
        let conn = self.connection(handle)?;
        let frame = Frame::new(Command::Subscribe)
            .with_header("id", format!("sub-{}", conn.next_id()))
            .with_header("destination", destination)
            .with_header("ack", "auto");
        conn.request_receipt(frame).await?;
        tracing::debug!("Subscribed to {}", destination);
        Ok(())
    }

    async fn send(
        &self,
        handle: &SessionHandle,
        destination: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ClientError> {
        let conn = self.connection(handle)?;
        let frame = Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", content_type)
            .with_body(body);
        conn.write_frame(&frame).await
    }

    async fn disconnect(&self, handle: &SessionHandle) -> Result<(), ClientError> {
        let Some(conn) = self.connections.lock().remove(&handle.id) else {
            return Ok(());
        };
        tracing::debug!("Closing session {}...", conn.id);
        conn.closing.store(true, Ordering::SeqCst);

        if let Err(e) = conn.request_receipt(Frame::new(Command::Disconnect)).await {
            tracing::debug!("DISCONNECT receipt not received: {}", e);
        }
        conn.shutdown().await;
        tracing::debug!("Session {} closed", conn.id);
        Ok(())
    }
}
