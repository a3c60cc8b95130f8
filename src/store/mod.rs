use crate::config::ServiceConfig;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio::sync::mpsc::Receiver;

pub mod etcd;
pub mod memory;

/// Buffer size of the lazy service-config stream.
const CONFIG_STREAM_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("storage transport error: {0}")]
    Transport(String),

    #[error("failed to decode stored value: {0}")]
    Decode(String),
}

/// A finite, non-restartable stream of service configs plus a failure
/// channel. The producer closes both ends when it is done or on the first
/// error.
pub struct ConfigStream {
    pub configs: Receiver<ServiceConfig>,
    pub errors: Receiver<StoreError>,
}

/// Key/value persistence for heartbeats, alarm markers, notification
/// bookkeeping and service configs.
///
/// The contract is strictly last-writer-wins per key; callers never assume
/// atomicity across records.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn set_last_heartbeat(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError>;
    async fn last_heartbeat(&self, id: &str) -> Result<DateTime<Utc>, StoreError>;

    async fn set_alarm_active_since(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError>;
    async fn alarm_active_since(&self, id: &str) -> Result<DateTime<Utc>, StoreError>;

    /// Idempotent; clearing an absent alarm succeeds.
    async fn clear_alarm(&self, id: &str) -> Result<(), StoreError>;

    async fn set_last_message_send(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError>;
    async fn last_message_send(&self, id: &str) -> Result<DateTime<Utc>, StoreError>;

    async fn save_service_config(&self, config: ServiceConfig) -> Result<(), StoreError>;

    /// Idempotent; deleting an absent config succeeds.
    async fn delete_service_config(&self, id: &str) -> Result<(), StoreError>;

    async fn service_config(&self, id: &str) -> Result<ServiceConfig, StoreError>;

    fn service_configs(&self) -> ConfigStream;
}

/// Timestamps are stored as RFC 3339 strings with nanosecond precision so
/// that KV backends without a native time type can hold them.
pub(crate) fn encode_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| StoreError::Decode(format!("invalid timestamp {raw:?}: {err}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_round_trip_with_nanosecond_precision() {
        let t = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let encoded = encode_timestamp(t);
        assert!(encoded.ends_with("Z"));
        assert_eq!(decode_timestamp(&encoded).unwrap(), t);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_timestamp("not a timestamp"),
            Err(StoreError::Decode(_))
        ));
    }
}
