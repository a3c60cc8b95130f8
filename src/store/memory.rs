use super::{ConfigStream, Storage, StoreError, CONFIG_STREAM_BUFFER};
use crate::config::ServiceConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Default)]
struct Maps {
    heartbeats: HashMap<String, DateTime<Utc>>,
    alarms: HashMap<String, DateTime<Utc>>,
    last_message: HashMap<String, DateTime<Utc>>,
    services: BTreeMap<String, ServiceConfig>,
}

/// Single-node storage backed by in-process maps behind one mutex.
pub struct MemoryStorage {
    maps: Mutex<Maps>,
}

impl MemoryStorage {
    pub fn new(services: Vec<ServiceConfig>) -> Self {
        let services = services
            .into_iter()
            .map(|config| (config.id.clone(), config))
            .collect();

        Self {
            maps: Mutex::new(Maps {
                services,
                ..Maps::default()
            }),
        }
    }

    fn maps(&self) -> std::sync::MutexGuard<'_, Maps> {
        self.maps.lock().expect("memory storage mutex poisoned")
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn set_last_heartbeat(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError> {
        self.maps().heartbeats.insert(id.to_string(), t);
        Ok(())
    }

    async fn last_heartbeat(&self, id: &str) -> Result<DateTime<Utc>, StoreError> {
        self.maps()
            .heartbeats
            .get(id)
            .copied()
            .ok_or(StoreError::NotFound)
    }

    async fn set_alarm_active_since(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError> {
        self.maps().alarms.insert(id.to_string(), t);
        Ok(())
    }

    async fn alarm_active_since(&self, id: &str) -> Result<DateTime<Utc>, StoreError> {
        self.maps()
            .alarms
            .get(id)
            .copied()
            .ok_or(StoreError::NotFound)
    }

    async fn clear_alarm(&self, id: &str) -> Result<(), StoreError> {
        self.maps().alarms.remove(id);
        Ok(())
    }

    async fn set_last_message_send(&self, id: &str, t: DateTime<Utc>) -> Result<(), StoreError> {
        self.maps().last_message.insert(id.to_string(), t);
        Ok(())
    }

    async fn last_message_send(&self, id: &str) -> Result<DateTime<Utc>, StoreError> {
        self.maps()
            .last_message
            .get(id)
            .copied()
            .ok_or(StoreError::NotFound)
    }

    async fn save_service_config(&self, config: ServiceConfig) -> Result<(), StoreError> {
        self.maps().services.insert(config.id.clone(), config);
        Ok(())
    }

    async fn delete_service_config(&self, id: &str) -> Result<(), StoreError> {
        self.maps().services.remove(id);
        Ok(())
    }

    async fn service_config(&self, id: &str) -> Result<ServiceConfig, StoreError> {
        self.maps()
            .services
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn service_configs(&self) -> ConfigStream {
        let snapshot: Vec<ServiceConfig> = self.maps().services.values().cloned().collect();

        let (config_tx, config_rx) = mpsc::channel(CONFIG_STREAM_BUFFER);
        let (_error_tx, error_rx) = mpsc::channel::<StoreError>(CONFIG_STREAM_BUFFER);

        tokio::spawn(async move {
            for config in snapshot {
                if config_tx.send(config).await.is_err() {
                    return;
                }
            }
        });

        ConfigStream {
            configs: config_rx,
            errors: error_rx,
        }
    }
}
