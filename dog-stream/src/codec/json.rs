use crate::codec::{MessageCodec, WireFrame, WireMessage};
use crate::types::Headers;
use crate::{StreamError, StreamResult};

/// JSON wire codec
///
/// The payload must itself be JSON; it is embedded as a value next to the
/// headers so the stored text stays readable from broker tooling.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, headers: &Headers, payload: &[u8]) -> StreamResult<String> {
        let payload: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| StreamError::Serialization(format!("payload is not valid JSON: {}", e)))?;

        let frame = WireFrame {
            headers: headers.clone(),
            payload,
        };
        Ok(serde_json::to_string(&frame)?)
    }

    fn decode(&self, body: &str) -> StreamResult<WireMessage> {
        let frame: WireFrame = serde_json::from_str(body)?;
        Ok(WireMessage {
            headers: frame.headers,
            payload: serde_json::to_vec(&frame.payload)?,
        })
    }

    fn codec_id(&self) -> &'static str {
        "json"
    }
}
