use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Broker-assigned identifier of a log record
///
/// Ids have the `<millis>-<sequence>` shape and are strictly increasing within
/// one stream key. Ordering compares the numeric parts, not the text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    /// Build an id from its numeric parts
    pub fn new(millis: u64, sequence: u64) -> Self {
        Self(format!("{}-{}", millis, sequence))
    }

    /// Create a record id from a string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(millis, sequence)`; `None` when the id is not broker-shaped
    pub fn parts(&self) -> Option<(u64, u64)> {
        let (millis, sequence) = self.0.split_once('-')?;
        Some((millis.parse().ok()?, sequence.parse().ok()?))
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.parts(), other.parts()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
