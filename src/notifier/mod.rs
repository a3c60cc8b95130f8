use crate::config::{NotificationConfig, ServiceConfig};
use crate::queue::{Queue, QueueError};
use crate::store::{Storage, StoreError};
use crate::util::GuardHandle;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

mod slack;
mod webhook;

/// Client-side timeout for outbound notification calls.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// One pending notification dispatch, carrying a snapshot of the service
/// config so consumers on other nodes need no further lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTask {
    pub service: ServiceConfig,
    pub notification: NotificationConfig,
    #[serde(default, rename = "isRecoveryMessage")]
    pub is_recovery: bool,
}

/// Fans notification work out to the configured sinks, either inline or
/// through the cluster-wide queue when one is wired.
pub struct Notifier {
    store: Arc<dyn Storage>,
    queue: Option<Arc<dyn Queue>>,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(store: Arc<dyn Storage>, queue: Option<Arc<dyn Queue>>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(DISPATCH_TIMEOUT)
            .build()
            .expect("default reqwest client is always buildable");

        Arc::new(Self { store, queue, http })
    }

    /// Starts the per-node queue consumer loop. Returns `None` when no
    /// queue is wired (memory backend).
    pub fn start_consumer(self: &Arc<Self>) -> Option<GuardHandle> {
        let queue = self.queue.clone()?;
        let notifier = self.clone();

        Some(GuardHandle::new(async move {
            loop {
                match queue.dequeue().await {
                    Ok(task) => {
                        // Debounce was already decided at enqueue time.
                        if let Err(err) = notifier
                            .dispatch(&task.service, &task.notification, task.is_recovery)
                            .await
                        {
                            tracing::error!(
                                service = %task.service.id,
                                ?err,
                                "failed to dispatch notification task"
                            );
                        }
                    }
                    Err(QueueError::Empty) => {
                        tracing::info!("notification queue closed");
                        break;
                    }
                    Err(err) => {
                        tracing::error!(?err, "stopped reading notification tasks from queue");
                        break;
                    }
                }
            }
        }))
    }

    /// Sends (or enqueues) all alert notifications for a service, unless
    /// the debounce window suppresses them.
    pub async fn send_alerts(&self, service: &ServiceConfig) -> Result<()> {
        if service.debounce > Duration::ZERO {
            match self.store.last_message_send(&service.id).await {
                Ok(last_message) => {
                    let debounce = chrono::Duration::from_std(service.debounce)
                        .context("debounce out of range")?;
                    if Utc::now() - debounce < last_message {
                        tracing::info!(
                            service = %service.id,
                            "suppressing alerts inside the debounce window"
                        );
                        return Ok(());
                    }
                }
                Err(StoreError::NotFound) => {}
                Err(err) => {
                    // Unreadable bookkeeping never suppresses an alert.
                    tracing::warn!(service = %service.id, ?err, "failed to load last-message timestamp");
                }
            }
        }

        tracing::info!(service = %service.id, "sending out alert messages");
        self.fan_out(service, &service.alert_notifications, false)
            .await
    }

    /// Recovery notifications are never debounced.
    pub async fn send_recovery_notifications(&self, service: &ServiceConfig) -> Result<()> {
        tracing::info!(service = %service.id, "sending out recovery messages");
        self.fan_out(service, &service.recovery_notifications, true)
            .await
    }

    async fn fan_out(
        &self,
        service: &ServiceConfig,
        notifications: &[NotificationConfig],
        is_recovery: bool,
    ) -> Result<()> {
        for notification in notifications {
            match &self.queue {
                Some(queue) => {
                    queue
                        .enqueue(NotificationTask {
                            service: service.clone(),
                            notification: notification.clone(),
                            is_recovery,
                        })
                        .await?;
                }
                None => {
                    self.dispatch(service, notification, is_recovery).await?;
                }
            }
        }

        self.store
            .set_last_message_send(&service.id, Utc::now())
            .await?;

        Ok(())
    }

    async fn dispatch(
        &self,
        service: &ServiceConfig,
        notification: &NotificationConfig,
        is_recovery: bool,
    ) -> Result<()> {
        match notification {
            NotificationConfig::Webhook(config) => {
                webhook::send(&self.http, service, config).await
            }
            NotificationConfig::Slack(config) => {
                let last_heartbeat = self.store.last_heartbeat(&service.id).await.ok();
                slack::send(&self.http, service, config, last_heartbeat, is_recovery).await
            }
        }
    }
}
