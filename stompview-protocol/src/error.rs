//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or encoding messages on the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown STOMP command: {0:?}")]
    InvalidCommand(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("invalid header escape sequence: \\{0}")]
    InvalidEscape(char),

    #[error("invalid content-length header: {0:?}")]
    InvalidContentLength(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame body not terminated by NUL after {0} bytes")]
    MissingTerminator(usize),

    #[error("invalid UTF-8 in frame headers")]
    InvalidUtf8,

    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while decoding an inbound payload into a value tree.
///
/// Decode failures never abort a session; the caller logs and drops the frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidCommand("HELLO".to_string());
        assert!(err.to_string().contains("HELLO"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::InvalidEscape('t');
        assert_eq!(err.to_string(), "invalid header escape sequence: \\t");

        let err = ProtocolError::MissingHeader("destination");
        assert!(err.to_string().contains("destination"));
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));

        let err = DecodeError::TooLarge { size: 10, max: 5 };
        assert!(err.to_string().contains("max 5"));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = DecodeError::from(json_err);
        assert!(err.to_string().starts_with("malformed JSON"));
    }
}
