pub mod json;

use serde::{Deserialize, Serialize};

use crate::types::Headers;
use crate::StreamResult;

/// Decoded wire message: headers plus the application payload bytes
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub headers: Headers,
    pub payload: Vec<u8>,
}

/// Serialized shape stored in the broker for both envelope flavors
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireFrame {
    #[serde(default)]
    pub headers: Headers,
    pub payload: serde_json::Value,
}

/// Turns envelope contents into the text handed to the broker and back
pub trait MessageCodec: Send + Sync {
    /// Encode headers and payload into wire text
    fn encode(&self, headers: &Headers, payload: &[u8]) -> StreamResult<String>;

    /// Decode wire text back into headers and payload
    fn decode(&self, body: &str) -> StreamResult<WireMessage>;

    /// Get codec identifier
    fn codec_id(&self) -> &'static str;
}
