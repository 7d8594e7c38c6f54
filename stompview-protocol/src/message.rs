//! Outbound request payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content type attached to every request frame.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// User-supplied request parameters.
///
/// A fresh [`RequestPayload`] (with its own `requestId`) is derived from this
/// for every send, so the same parameters can be submitted repeatedly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRequest {
    pub trader: Option<String>,
    pub book_owners: Vec<String>,
}

impl DataRequest {
    pub fn new(trader: Option<String>, book_owners: Vec<String>) -> Self {
        Self {
            trader,
            book_owners,
        }
    }

    /// Builds a request from raw form input.
    ///
    /// The trader is trimmed and becomes `None` when blank. Book owners are a
    /// comma-separated list; see [`parse_csv`].
    pub fn from_input(trader: &str, book_owners: &str) -> Self {
        let trader = trader.trim();
        Self {
            trader: (!trader.is_empty()).then(|| trader.to_string()),
            book_owners: parse_csv(book_owners),
        }
    }

    /// Creates the wire payload with a newly generated request ID.
    pub fn to_payload(&self) -> RequestPayload {
        RequestPayload {
            trader: self.trader.clone(),
            book_owners: self.book_owners.clone(),
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

/// JSON request body as sent to the server.
///
/// `requestId` lets the server correlate responses when it supports it; the
/// client itself never depends on correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub trader: Option<String>,
    pub book_owners: Vec<String>,
    pub request_id: String,
}

/// Splits comma-separated input, trimming entries and dropping empty ones.
pub fn parse_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
