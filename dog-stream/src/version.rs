use tracing::{debug, warn};

use crate::{broker::StreamBroker, StreamError, StreamResult};

/// First broker major version with stream consumer groups
pub const MIN_CONSUMER_GROUP_MAJOR: u32 = 5;

/// Major component of a dotted version string such as `7.2.4`
pub fn parse_major(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.trim().parse().ok()
}

/// Fail if the broker is known to be too old for consumer groups
///
/// An unknown or unparsable version only warns: not being able to tell is
/// not a reason to block startup.
pub async fn ensure_consumer_group_support(broker: &dyn StreamBroker, required: u32) -> StreamResult<()> {
    let version = match broker.server_version().await {
        Ok(Some(version)) => version,
        Ok(None) => {
            warn!("Broker did not report a version, skipping consumer group compatibility check");
            return Ok(());
        }
        Err(err) => {
            warn!("Could not read broker version, skipping compatibility check: {}", err);
            return Ok(());
        }
    };

    match parse_major(&version) {
        Some(major) if major < required => Err(StreamError::IncompatibleBroker {
            found: version,
            required,
        }),
        Some(_) => {
            debug!(version = %version, "Broker supports consumer groups");
            Ok(())
        }
        None => {
            warn!(version = %version, "Unrecognised broker version, skipping compatibility check");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[test]
    fn test_parse_major() {
        assert_eq!(parse_major("7.2.4"), Some(7));
        assert_eq!(parse_major(" 5 "), Some(5));
        assert_eq!(parse_major("unstable"), None);
        assert_eq!(parse_major(""), None);
    }

    #[tokio::test]
    async fn test_old_broker_is_rejected() {
        let broker = MemoryBroker::new().with_version(Some("4.0.9"));
        let err = ensure_consumer_group_support(&broker, MIN_CONSUMER_GROUP_MAJOR)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::IncompatibleBroker { ref found, required: 5 } if found == "4.0.9"));
    }

    #[tokio::test]
    async fn test_unknown_versions_proceed() {
        let unknown = MemoryBroker::new().with_version(None);
        assert!(ensure_consumer_group_support(&unknown, 5).await.is_ok());

        let garbage = MemoryBroker::new().with_version(Some("nightly"));
        assert!(ensure_consumer_group_support(&garbage, 5).await.is_ok());

        let exact = MemoryBroker::new().with_version(Some("5.0.0"));
        assert!(ensure_consumer_group_support(&exact, 5).await.is_ok());
    }
}
