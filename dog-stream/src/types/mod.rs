pub mod consumer;
pub mod envelope;
pub mod ids;
pub mod record;

pub use consumer::{consumer_name, ConsumerIdentity};
pub use envelope::{BroadcastEnvelope, Envelope, EnvelopeKind, Headers, LogEnvelope};
pub use ids::RecordId;
pub use record::{ChannelMessage, ConsumerPending, LogRecord, PendingEntry, PendingSummary};
