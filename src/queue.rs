use crate::coordination::{acquire_lock, CoordinationError};
use crate::notifier::NotificationTask;
use crate::session::Session;
use crate::store::encode_timestamp;
use async_trait::async_trait;
use chrono::Utc;
use etcd_client::{EventType, GetOptions, SortOrder, SortTarget, WatchOptions};
use thiserror::Error;

/// Prefix the cluster-wide notification queue lives under. The prefix
/// itself doubles as the consumer lock key.
pub const QUEUE_PREFIX: &str = "/deadman-switch/queue";

#[derive(Debug, Error)]
pub enum QueueError {
    /// The change stream closed without delivering an item. Expected on
    /// shutdown only.
    #[error("queue is empty")]
    Empty,

    #[error("failed to encode or decode queue item: {0}")]
    Codec(String),

    #[error("queue transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

impl From<etcd_client::Error> for QueueError {
    fn from(err: etcd_client::Error) -> Self {
        QueueError::Transport(err.to_string())
    }
}

/// FIFO-ish work queue of notification tasks with at-most-one-consumer
/// dequeue semantics.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, task: NotificationTask) -> Result<(), QueueError>;

    /// Blocks until a task is available. The consumer lock linearizes the
    /// read-then-delete pair, so two consumers never observe the same task;
    /// ordering across consumers is only approximately FIFO.
    async fn dequeue(&self) -> Result<NotificationTask, QueueError>;
}

pub struct EtcdQueue {
    session: Session,
    prefix: String,
}

impl EtcdQueue {
    pub fn new(session: Session, prefix: &str) -> Self {
        Self {
            session,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    fn items_prefix(&self) -> String {
        format!("{}/items/", self.prefix)
    }
}

#[async_trait]
impl Queue for EtcdQueue {
    async fn enqueue(&self, task: NotificationTask) -> Result<(), QueueError> {
        // Item keys are timestamps; RFC 3339 with fixed-width nanoseconds
        // sorts lexicographically in insertion order. Colliding keys are
        // last-writer-wins; the checker re-issues lost alerts while the
        // alarm stands.
        let key = format!("{}{}", self.items_prefix(), encode_timestamp(Utc::now()));
        let value =
            serde_json::to_string(&task).map_err(|err| QueueError::Codec(err.to_string()))?;

        tracing::debug!(service = %task.service.id, key, "enqueuing notification task");
        self.session.kv_client().put(key, value, None).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<NotificationTask, QueueError> {
        let _lock = acquire_lock(&self.session, &self.prefix).await?;

        let items_prefix = self.items_prefix();
        let mut kv = self.session.kv_client();

        let first = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend)
            .with_limit(1);
        let response = kv.get(items_prefix.clone(), Some(first)).await?;

        let (key, value) = match response.kvs().first() {
            Some(item) => (item.key().to_vec(), item.value().to_vec()),
            None => {
                let (mut watcher, mut stream) = self
                    .session
                    .watch_client()
                    .watch(items_prefix, Some(WatchOptions::new().with_prefix()))
                    .await?;

                let item = wait_for_item(&mut stream).await;
                let _ = watcher.cancel().await;
                item?
            }
        };

        let task: NotificationTask =
            serde_json::from_slice(&value).map_err(|err| QueueError::Codec(err.to_string()))?;
        kv.delete(key, None).await?;

        Ok(task)
    }
}

async fn wait_for_item(
    stream: &mut etcd_client::WatchStream,
) -> Result<(Vec<u8>, Vec<u8>), QueueError> {
    while let Some(response) = stream.message().await? {
        for event in response.events() {
            if event.event_type() != EventType::Put {
                continue;
            }
            if let Some(kv) = event.kv() {
                return Ok((kv.key().to_vec(), kv.value().to_vec()));
            }
        }
    }

    Err(QueueError::Empty)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{NotificationConfig, ServiceConfig, WebhookConfig};
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn item_keys_sort_in_insertion_order() {
        let earlier = Utc.timestamp_opt(1_700_000_000, 5).unwrap();
        let later = Utc.timestamp_opt(1_700_000_000, 70).unwrap();
        let much_later = Utc.timestamp_opt(1_700_000_001, 0).unwrap();

        let keys = vec![
            encode_timestamp(earlier),
            encode_timestamp(later),
            encode_timestamp(much_later),
        ];

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn task_wire_shape_is_stable() {
        let task = NotificationTask {
            service: ServiceConfig {
                id: "svc-1".to_string(),
                token: String::new(),
                timeout: Duration::from_secs(30),
                debounce: Duration::ZERO,
                alert_notifications: vec![],
                recovery_notifications: vec![],
            },
            notification: NotificationConfig::Webhook(WebhookConfig {
                url: "https://example.com/hook".to_string(),
                method: "POST".to_string(),
                body: String::new(),
                headers: HashMap::new(),
            }),
            is_recovery: true,
        };

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["service"]["id"], "svc-1");
        assert_eq!(value["notification"]["type"], "webhook");
        assert_eq!(value["isRecoveryMessage"], true);

        let decoded: NotificationTask = serde_json::from_value(value).unwrap();
        assert!(decoded.is_recovery);
        assert_eq!(decoded.service.id, "svc-1");
    }
}
