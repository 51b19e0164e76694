//! Messaging configuration.
//!
//! Typed settings come either from serde (camelCase keys) or from a flat
//! [`ConfigMap`] of dotted keys, which is how the DogRS apps configure
//! themselves:
//!
//! ```text
//! stream.batchSize            = 10
//! stream.blockTimeout         = 2s
//! pendingMessage.enabled      = true
//! pendingMessage.expireTime   = 5m
//! pendingMessage.cron         = 35 * * * * *
//! pendingMessage.lockTimeout  = 30s
//! cleanup.enabled             = true
//! cleanup.maxLength           = 10000
//! cleanup.cron                = 0 0 * * * *
//! cleanup.lockTimeout         = 60s
//! ```
//!
//! Environment variables map onto the same keys:
//! `DOG__PENDINGMESSAGE__EXPIRETIME=10m` sets `pendingMessage.expireTime`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{schedule::CronSchedule, StreamError, StreamResult};

/// Default environment prefix for [`MessagingConfig::from_env`]
pub const ENV_PREFIX: &str = "DOG__";

/// Read-loop settings shared by every stream listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Max records per group read
    pub batch_size: usize,
    /// How long one read waits for new records
    #[serde(with = "duration_text")]
    pub block_timeout: Duration,
    /// Pause after a failed read before trying again
    #[serde(with = "duration_text")]
    pub error_backoff: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block_timeout: Duration::from_secs(2),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Pending-entry resend job settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PendingMessageConfig {
    pub enabled: bool,
    /// Idle time after which a pending entry is redelivered
    #[serde(with = "duration_text")]
    pub expire_time: Duration,
    pub cron: String,
    /// Lease on the cluster lock
    #[serde(with = "duration_text")]
    pub lock_timeout: Duration,
}

impl Default for PendingMessageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_time: Duration::from_secs(5 * 60),
            cron: "35 * * * * *".to_string(),
            lock_timeout: Duration::from_secs(30),
        }
    }
}

/// Stream trim job settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Approximate number of records kept per stream
    pub max_length: usize,
    pub cron: String,
    #[serde(with = "duration_text")]
    pub lock_timeout: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 10_000,
            cron: "0 0 * * * *".to_string(),
            lock_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagingConfig {
    pub stream: StreamSettings,
    pub pending_message: PendingMessageConfig,
    pub cleanup: CleanupConfig,
}

impl MessagingConfig {
    /// Build from dotted keys, falling back to defaults for missing ones
    pub fn from_map(map: &ConfigMap) -> StreamResult<Self> {
        let mut config = Self::default();

        if let Some(v) = map.get_usize("stream.batchSize")? {
            config.stream.batch_size = v;
        }
        if let Some(v) = map.get_duration("stream.blockTimeout")? {
            config.stream.block_timeout = v;
        }
        if let Some(v) = map.get_duration("stream.errorBackoff")? {
            config.stream.error_backoff = v;
        }

        if let Some(v) = map.get_bool("pendingMessage.enabled")? {
            config.pending_message.enabled = v;
        }
        if let Some(v) = map.get_duration("pendingMessage.expireTime")? {
            config.pending_message.expire_time = v;
        }
        if let Some(v) = map.get("pendingMessage.cron") {
            config.pending_message.cron = v.to_string();
        }
        if let Some(v) = map.get_duration("pendingMessage.lockTimeout")? {
            config.pending_message.lock_timeout = v;
        }

        if let Some(v) = map.get_bool("cleanup.enabled")? {
            config.cleanup.enabled = v;
        }
        if let Some(v) = map.get_usize("cleanup.maxLength")? {
            config.cleanup.max_length = v;
        }
        if let Some(v) = map.get("cleanup.cron") {
            config.cleanup.cron = v.to_string();
        }
        if let Some(v) = map.get_duration("cleanup.lockTimeout")? {
            config.cleanup.lock_timeout = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Build from `DOG__*` environment variables
    pub fn from_env() -> StreamResult<Self> {
        Self::from_map(&ConfigMap::from_env(ENV_PREFIX))
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> StreamResult<()> {
        if self.stream.batch_size == 0 {
            return Err(StreamError::invalid_config("stream.batchSize", "must be at least 1"));
        }
        if self.pending_message.enabled {
            CronSchedule::parse(&self.pending_message.cron)?;
        }
        if self.cleanup.enabled {
            CronSchedule::parse(&self.cleanup.cron)?;
        }
        Ok(())
    }
}

/// Flat string key/value store with case-insensitive dotted keys
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    values: HashMap<String, String>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect variables starting with `prefix`; `__` separates key segments
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(std::env::vars(), prefix)
    }

    pub fn from_vars<I>(vars: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = Self::new();
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                map.set(stripped.replace("__", "."), value);
            }
        }
        map
    }

    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.values.insert(normalize(key.as_ref()), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&normalize(key)).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(&normalize(key))
    }

    pub fn get_bool(&self, key: &str) -> StreamResult<Option<bool>> {
        self.parse_with(key, |v| match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err("expected a boolean".to_string()),
        })
    }

    pub fn get_usize(&self, key: &str) -> StreamResult<Option<usize>> {
        self.parse_with(key, |v| v.parse::<usize>().map_err(|e| e.to_string()))
    }

    pub fn get_duration(&self, key: &str) -> StreamResult<Option<Duration>> {
        self.parse_with(key, parse_duration)
    }

    fn parse_with<T>(
        &self,
        key: &str,
        parse: impl FnOnce(&str) -> Result<T, String>,
    ) -> StreamResult<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => parse(raw.trim())
                .map(Some)
                .map_err(|reason| StreamError::invalid_config(key, format!("'{}': {}", raw, reason))),
        }
    }
}

fn normalize(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

/// Parse `500ms`, `30s`, `5m`, `1h`; a bare number means seconds
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", text))?;

    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
        other => Err(format!("unknown duration unit '{}'", other)),
    }
}

/// Serde adapter: durations as `"30s"`-style text or bare seconds
mod duration_text {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}
