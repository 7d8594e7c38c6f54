//! STOMP 1.2 text frames.
//!
//! Frame layout:
//!
//! ```text
//! COMMAND EOL
//! *(header EOL)
//! EOL
//! *OCTET NUL
//! *(EOL)
//! ```
//!
//! EOL is `\n` or `\r\n`. Bare EOLs between frames are heart-beats and are
//! skipped by the decoder. When a `content-length` header is present the body
//! is read by length, otherwise up to the first NUL.

use crate::error::ProtocolError;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// STOMP commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,

    // Server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

/// A parsed STOMP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Repeated names are kept; the first one wins.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    /// Creates a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Returns the first value for a header name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Encodes the frame. A `content-length` header is added for non-empty
    /// bodies when the caller did not set one.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let escape = self.command.escapes_headers();
        let mut buf = BytesMut::with_capacity(64 + self.body.len());

        buf.put_slice(self.command.as_str().as_bytes());
        buf.put_u8(b'\n');

        for (name, value) in &self.headers {
            put_header_part(&mut buf, name, escape);
            buf.put_u8(b':');
            put_header_part(&mut buf, value, escape);
            buf.put_u8(b'\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            buf.put_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);

        if buf.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: buf.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    /// Nothing but leading heart-beats is consumed until a whole frame is
    /// available. Use a [`FrameDecoder`] when the same buffer is fed by
    /// repeated reads.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        FrameDecoder::new().decode(buf)
    }
}

/// Incremental frame decoder.
///
/// Remembers how far the buffer has already been searched, so a frame that
/// arrives over many reads is scanned once in total. Between calls the
/// buffer may only be appended to.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Leading bytes of the buffer already searched for the header end, or
    /// for the NUL terminator once the head is parsed.
    scanned: usize,
    head: Option<Head>,
}

#[derive(Debug)]
struct Head {
    command: Command,
    headers: Vec<(String, String)>,
    body_start: usize,
    content_length: Option<usize>,
}

impl Head {
    fn parse(text: &[u8], body_start: usize) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(text).map_err(|_| ProtocolError::InvalidUtf8)?;
        let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

        let command_line = lines.next().unwrap_or_default();
        let command = Command::parse(command_line)
            .ok_or_else(|| ProtocolError::InvalidCommand(command_line.to_string()))?;

        let escape = command.escapes_headers();
        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;
            if escape {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| ProtocolError::InvalidContentLength(v.clone()))
            })
            .transpose()?;

        Ok(Self {
            command,
            headers,
            body_start,
            content_length,
        })
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next frame from `buf`, with the same contract as
    /// [`Frame::decode`].
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if self.scanned > buf.len() {
            self.reset();
        }
        let result = self.step(buf);
        if result.is_err() {
            self.reset();
        }
        result
    }

    /// Forgets any partially scanned frame.
    pub fn reset(&mut self) {
        self.scanned = 0;
        self.head = None;
    }

    fn step(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let head = match self.head.take() {
            Some(head) => head,
            None => match self.read_head(buf)? {
                Some(head) => head,
                None => return Ok(None),
            },
        };

        let Some(body_len) = self.body_len(&head, buf)? else {
            self.head = Some(head);
            return Ok(None);
        };

        buf.advance(head.body_start);
        let body = buf.split_to(body_len).freeze();
        buf.advance(1);
        self.scanned = 0;

        Ok(Some(Frame {
            command: head.command,
            headers: head.headers,
            body,
        }))
    }

    fn read_head(&mut self, buf: &mut BytesMut) -> Result<Option<Head>, ProtocolError> {
        if self.scanned == 0 {
            skip_heartbeats(buf);
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let Some((header_end, body_start)) = find_header_end(buf, self.scanned) else {
            // The blank line may straddle two reads.
            self.scanned = buf.len().saturating_sub(2);
            check_buffered(buf.len())?;
            return Ok(None);
        };

        let head = Head::parse(&buf[..header_end], body_start)?;
        self.scanned = body_start;
        Ok(Some(head))
    }

    fn body_len(&mut self, head: &Head, buf: &BytesMut) -> Result<Option<usize>, ProtocolError> {
        match head.content_length {
            Some(len) => {
                let frame_len = head.body_start.saturating_add(len).saturating_add(1);
                if frame_len > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: frame_len,
                        max: MAX_FRAME_SIZE,
                    });
                }
                if buf.len() < frame_len {
                    return Ok(None);
                }
                if buf[head.body_start + len] != 0 {
                    return Err(ProtocolError::MissingTerminator(len));
                }
                Ok(Some(len))
            }
            None => match buf[self.scanned..].iter().position(|&b| b == 0) {
                Some(offset) => Ok(Some(self.scanned + offset - head.body_start)),
                None => {
                    self.scanned = buf.len();
                    check_buffered(buf.len())?;
                    Ok(None)
                }
            },
        }
    }
}

/// Heart-beat frame: a single EOL.
pub const HEARTBEAT: &[u8] = b"\n";

fn check_buffered(buffered: usize) -> Result<(), ProtocolError> {
    if buffered > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: buffered,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

fn skip_heartbeats(buf: &mut BytesMut) {
    loop {
        if buf.starts_with(b"\n") {
            buf.advance(1);
        } else if buf.starts_with(b"\r\n") {
            buf.advance(2);
        } else {
            break;
        }
    }
}

/// Finds the blank line ending the header block, searching from `from`.
///
/// Returns (end of header text, start of body).
fn find_header_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    for (i, &b) in buf.iter().enumerate().skip(from) {
        if b != b'\n' {
            continue;
        }
        let rest = &buf[i + 1..];
        if rest.starts_with(b"\n") {
            return Some((trim_cr(buf, i), i + 2));
        }
        if rest.starts_with(b"\r\n") {
            return Some((trim_cr(buf, i), i + 3));
        }
    }
    None
}

fn trim_cr(buf: &[u8], end: usize) -> usize {
    if end > 0 && buf[end - 1] == b'\r' {
        end - 1
    } else {
        end
    }
}

fn put_header_part(buf: &mut BytesMut, s: &str, escape: bool) {
    if !escape {
        buf.put_slice(s.as_bytes());
        return;
    }
    for c in s.chars() {
        match c {
            '\\' => buf.put_slice(b"\\\\"),
            '\n' => buf.put_slice(b"\\n"),
            '\r' => buf.put_slice(b"\\r"),
            ':' => buf.put_slice(b"\\c"),
            c => {
                let mut tmp = [0u8; 4];
                buf.put_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

fn unescape(s: &str) -> Result<String, ProtocolError> {
    if !s.contains('\\') {
        return Ok(s.to_string());
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => return Err(ProtocolError::InvalidEscape(other)),
            None => return Err(ProtocolError::InvalidEscape(' ')),
        }
    }
    Ok(out)
}
