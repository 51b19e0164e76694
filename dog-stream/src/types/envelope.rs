use serde::Serialize;
use std::collections::HashMap;

use crate::StreamResult;

/// Flat string headers carried alongside every payload
pub type Headers = HashMap<String, String>;

/// Ephemeral envelope published to a broadcast channel
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEnvelope {
    /// Target channel name
    pub channel: String,

    pub headers: Headers,

    /// Application JSON payload (opaque to this layer)
    pub payload: Vec<u8>,
}

impl BroadcastEnvelope {
    /// Create an envelope from raw JSON bytes
    pub fn new(channel: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            headers: Headers::new(),
            payload,
        }
    }

    /// Create an envelope by serializing a payload value
    pub fn json<T: Serialize>(channel: impl Into<String>, payload: &T) -> StreamResult<Self> {
        Ok(Self::new(channel, serde_json::to_vec(payload)?))
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Durable envelope appended to a stream key
#[derive(Debug, Clone, PartialEq)]
pub struct LogEnvelope {
    /// Target stream key
    pub stream_key: String,

    pub headers: Headers,

    /// Application JSON payload (opaque to this layer)
    pub payload: Vec<u8>,
}

impl LogEnvelope {
    /// Create an envelope from raw JSON bytes
    pub fn new(stream_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            stream_key: stream_key.into(),
            headers: Headers::new(),
            payload,
        }
    }

    /// Create an envelope by serializing a payload value
    pub fn json<T: Serialize>(stream_key: impl Into<String>, payload: &T) -> StreamResult<Self> {
        Ok(Self::new(stream_key, serde_json::to_vec(payload)?))
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }
}

/// Envelope discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Broadcast,
    Log,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Log => "log",
        }
    }
}

/// Either envelope flavor, as seen by interceptors
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Broadcast(BroadcastEnvelope),
    Log(LogEnvelope),
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Broadcast(_) => EnvelopeKind::Broadcast,
            Self::Log(_) => EnvelopeKind::Log,
        }
    }

    /// Channel name or stream key, depending on the flavor
    pub fn destination(&self) -> &str {
        match self {
            Self::Broadcast(env) => &env.channel,
            Self::Log(env) => &env.stream_key,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Self::Broadcast(env) => &env.headers,
            Self::Log(env) => &env.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Self::Broadcast(env) => &mut env.headers,
            Self::Log(env) => &mut env.headers,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Broadcast(env) => &env.payload,
            Self::Log(env) => &env.payload,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers().get(key).map(|v| v.as_str())
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers_mut().insert(key.into(), value.into());
    }
}

impl From<BroadcastEnvelope> for Envelope {
    fn from(env: BroadcastEnvelope) -> Self {
        Self::Broadcast(env)
    }
}

impl From<LogEnvelope> for Envelope {
    fn from(env: LogEnvelope) -> Self {
        Self::Log(env)
    }
}
