//! Encoder and decoder for JSON payloads carried in STOMP frames.

use crate::error::{DecodeError, ProtocolError};
use crate::message::RequestPayload;
use crate::MAX_PAYLOAD_SIZE;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::fmt;

/// A decoded payload, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A JSON array: full replacement of the dataset.
    ///
    /// `skipped` counts array elements that were not objects.
    Snapshot {
        records: Vec<Map<String, Value>>,
        skipped: usize,
    },
    /// A single JSON object: insert-or-update keyed by identity.
    Upsert(Map<String, Value>),
    /// Anything else. Reported by the caller, never merged.
    Unrecognized(Unrecognized),
}

/// Why a payload could not be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unrecognized {
    /// Empty or whitespace-only body.
    Empty,
    /// Bare scalar (`42`, `"x"`, `true`, `null`).
    Scalar,
    /// Non-empty array without a single object element.
    NonObjectArray { len: usize },
}

impl fmt::Display for Unrecognized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unrecognized::Empty => write!(f, "empty payload"),
            Unrecognized::Scalar => write!(f, "bare scalar payload"),
            Unrecognized::NonObjectArray { len } => {
                write!(f, "array of {} non-object element(s)", len)
            }
        }
    }
}

/// Encodes outbound request payloads.
pub struct Encoder;

impl Encoder {
    /// Encodes a request payload as a JSON body.
    pub fn encode_request(payload: &RequestPayload) -> Result<Bytes, ProtocolError> {
        Self::encode_json(payload)
    }

    /// Encodes any JSON-serializable value.
    pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

/// Decodes and classifies inbound payloads.
pub struct Decoder;

impl Decoder {
    /// Parses raw bytes into a JSON value tree.
    pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(DecodeError::TooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Classifies a value tree as snapshot, upsert or unrecognized.
    pub fn classify(value: Value) -> Payload {
        match value {
            Value::Object(record) => Payload::Upsert(record),
            Value::Array(items) => {
                let len = items.len();
                let records: Vec<_> = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(record) => Some(record),
                        _ => None,
                    })
                    .collect();

                if len > 0 && records.is_empty() {
                    return Payload::Unrecognized(Unrecognized::NonObjectArray { len });
                }

                Payload::Snapshot {
                    skipped: len - records.len(),
                    records,
                }
            }
            _ => Payload::Unrecognized(Unrecognized::Scalar),
        }
    }

    /// Decodes and classifies in one step.
    ///
    /// Blank input is classified as [`Unrecognized::Empty`] rather than
    /// reported as malformed JSON.
    pub fn read(bytes: &[u8]) -> Result<Payload, DecodeError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Payload::Unrecognized(Unrecognized::Empty));
        }
        Self::decode(bytes).map(Self::classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DataRequest;
    use serde_json::json;

    #[test]
    fn test_classify_snapshot() {
        let payload = Decoder::read(br#"[{"id":1,"a":"x"},{"id":2,"a":"y"}]"#).unwrap();
        match payload {
            Payload::Snapshot { records, skipped } => {
                assert_eq!(records.len(), 2);
                assert_eq!(skipped, 0);
                assert_eq!(records[0]["id"], json!(1));
                assert_eq!(records[1]["a"], json!("y"));
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_upsert() {
        let payload = Decoder::read(br#"{"id":3,"a":"w"}"#).unwrap();
        assert!(matches!(payload, Payload::Upsert(ref r) if r["id"] == json!(3)));
    }

    #[test]
    fn test_classify_bare_scalar() {
        let payload = Decoder::read(b"42").unwrap();
        assert_eq!(payload, Payload::Unrecognized(Unrecognized::Scalar));

        let payload = Decoder::read(br#""42""#).unwrap();
        assert_eq!(payload, Payload::Unrecognized(Unrecognized::Scalar));

        let payload = Decoder::read(b"null").unwrap();
        assert_eq!(payload, Payload::Unrecognized(Unrecognized::Scalar));
    }

    #[test]
    fn test_classify_empty_input() {
        assert_eq!(
            Decoder::read(b"").unwrap(),
            Payload::Unrecognized(Unrecognized::Empty)
        );
        assert_eq!(
            Decoder::read(b"  \n\t").unwrap(),
            Payload::Unrecognized(Unrecognized::Empty)
        );
    }

    #[test]
    fn test_classify_array_of_scalars() {
        let payload = Decoder::read(b"[1, 2, 3]").unwrap();
        assert_eq!(
            payload,
            Payload::Unrecognized(Unrecognized::NonObjectArray { len: 3 })
        );
    }

    #[test]
    fn test_classify_mixed_array_skips_non_objects() {
        let payload = Decoder::read(br#"[{"id":1}, 7, "x", {"id":2}]"#).unwrap();
        match payload {
            Payload::Snapshot { records, skipped } => {
                assert_eq!(records.len(), 2);
                assert_eq!(skipped, 2);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_empty_array_is_snapshot() {
        let payload = Decoder::read(b"[]").unwrap();
        assert_eq!(
            payload,
            Payload::Snapshot {
                records: Vec::new(),
                skipped: 0
            }
        );
    }

    #[test]
    fn test_decode_truncated() {
        let result = Decoder::read(br#"{"id":1,"a":"#);
        assert!(matches!(result, Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let result = Decoder::decode(&[b'"', 0xff, 0xfe, b'"']);
        assert!(matches!(result, Err(DecodeError::InvalidUtf8)));
    }

    #[test]
    fn test_decode_preserves_field_order() {
        let value = Decoder::decode(br#"{"id":1,"zeta":2,"alpha":3}"#).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["id", "zeta", "alpha"]);
    }

    #[test]
    fn test_encode_request() {
        let payload = DataRequest::from_input("T", "A, B").to_payload();
        let encoded = Encoder::encode_request(&payload).unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["trader"], json!("T"));
        assert_eq!(value["bookOwners"], json!(["A", "B"]));
        assert_eq!(value["requestId"], json!(payload.request_id));
    }

    #[test]
    fn test_unrecognized_display() {
        assert_eq!(Unrecognized::Empty.to_string(), "empty payload");
        assert_eq!(
            Unrecognized::NonObjectArray { len: 2 }.to_string(),
            "array of 2 non-object element(s)"
        );
    }
}
