use serde::{Deserialize, Serialize};

use crate::transport::Payload;

/// Text frame exchanged over the websocket transport.
///
/// ```json
/// {"event": "ping", "data": {"v": 1}}
/// ```
///
/// `data` is omitted on the wire when an event carries no payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Option<Payload>) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Payload handed to listeners; a missing `data` field becomes `null`.
    pub fn into_payload(self) -> Payload {
        self.data.unwrap_or(Payload::Null)
    }
}
