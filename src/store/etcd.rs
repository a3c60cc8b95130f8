use super::{
    decode_timestamp, encode_timestamp, ConfigStream, Storage, StoreError, CONFIG_STREAM_BUFFER,
};
use crate::config::ServiceConfig;
use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etcd_client::GetOptions;
use tokio::sync::mpsc;

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

/// Storage backed by the replicated KV store.
///
/// Domain records are plain puts under a shared prefix (they must survive
/// node restarts, so they are not bound to the session lease) and every
/// value is either an RFC 3339 timestamp or a JSON service config.
pub struct EtcdStorage {
    session: Session,
    prefix: String,
}

impl EtcdStorage {
    pub fn new(session: Session, prefix: &str) -> Self {
        Self {
            session,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    fn key(&self, namespace: &str, id: &str) -> String {
        format!("{}/{}/{}", self.prefix, namespace, id)
    }

    async fn put_timestamp(
        &self,
        namespace: &str,
        id: &str,
        t: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.session
            .kv_client()
            .put(self.key(namespace, id), encode_timestamp(t), None)
            .await?;
        Ok(())
    }

    async fn get_timestamp(&self, namespace: &str, id: &str) -> Result<DateTime<Utc>, StoreError> {
        let response = self
            .session
            .kv_client()
            .get(self.key(namespace, id), None)
            .await?;

        let Some(kv) = response.kvs().first() else {
            return Err(StoreError::NotFound);
        };
        let raw = kv
            .value_str()
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        decode_timestamp(raw)
    }
}

#[async_trait]
impl Storage for EtcdStorage {
    async fn set_last_heartbeat(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError> {
        self.put_timestamp("heartbeats", id, t).await
    }

    async fn last_heartbeat(&self, id: &str) -> Result<DateTime<Utc>, StoreError> {
        self.get_timestamp("heartbeats", id).await
    }

    async fn set_alarm_active_since(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError> {
        self.put_timestamp("alarms", id, t).await
    }

    async fn alarm_active_since(&self, id: &str) -> Result<DateTime<Utc>, StoreError> {
        self.get_timestamp("alarms", id).await
    }

    async fn clear_alarm(&self, id: &str) -> Result<(), StoreError> {
        self.session
            .kv_client()
            .delete(self.key("alarms", id), None)
            .await?;
        Ok(())
    }

    async fn set_last_message_send(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError> {
        self.put_timestamp("lastMessage", id, t).await
    }

    async fn last_message_send(&self, id: &str) -> Result<DateTime<Utc>, StoreError> {
        self.get_timestamp("lastMessage", id).await
    }

    async fn save_service_config(&self, config: ServiceConfig) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&config)
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        self.session
            .kv_client()
            .put(self.key("services", &config.id), encoded, None)
            .await?;
        Ok(())
    }

    async fn delete_service_config(&self, id: &str) -> Result<(), StoreError> {
        self.session
            .kv_client()
            .delete(self.key("services", id), None)
            .await?;
        Ok(())
    }

    async fn service_config(&self, id: &str) -> Result<ServiceConfig, StoreError> {
        let response = self
            .session
            .kv_client()
            .get(self.key("services", id), None)
            .await?;

        let Some(kv) = response.kvs().first() else {
            return Err(StoreError::NotFound);
        };
        serde_json::from_slice(kv.value()).map_err(|err| StoreError::Decode(err.to_string()))
    }

    fn service_configs(&self) -> ConfigStream {
        let mut kv = self.session.kv_client();
        let prefix = format!("{}/services/", self.prefix);

        let (config_tx, config_rx) = mpsc::channel(CONFIG_STREAM_BUFFER);
        let (error_tx, error_rx) = mpsc::channel(CONFIG_STREAM_BUFFER);

        tokio::spawn(async move {
            let response = match kv.get(prefix, Some(GetOptions::new().with_prefix())).await {
                Ok(response) => response,
                Err(err) => {
                    let _ = error_tx.send(StoreError::from(err)).await;
                    return;
                }
            };

            for item in response.kvs() {
                match serde_json::from_slice::<ServiceConfig>(item.value()) {
                    Ok(config) => {
                        if config_tx.send(config).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            key = %String::from_utf8_lossy(item.key()),
                            %err,
                            "failed to decode stored service config"
                        );
                        let _ = error_tx.send(StoreError::Decode(err.to_string())).await;
                        return;
                    }
                }
            }
        });

        ConfigStream {
            configs: config_rx,
            errors: error_rx,
        }
    }
}
