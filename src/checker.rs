use crate::config::ServiceConfig;
use crate::coordination::{Coordination, CHECK_LEADER_SLOT};
use crate::notifier::Notifier;
use crate::store::{Storage, StoreError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Periodically scans all service configs and transitions overdue services
/// into the alarm state. Only the elected leader evaluates deadlines; every
/// other node's tick is a no-op.
pub struct Checker {
    store: Arc<dyn Storage>,
    coordination: Option<Arc<dyn Coordination>>,
    notifier: Arc<Notifier>,
    interval: Duration,
}

impl Checker {
    pub fn new(
        store: Arc<dyn Storage>,
        coordination: Option<Arc<dyn Coordination>>,
        notifier: Arc<Notifier>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            coordination,
            notifier,
            interval,
        }
    }

    pub async fn run(self) {
        loop {
            tokio::time::sleep(self.interval).await;

            if let Err(err) = self.check_deadlines_if_leader().await {
                tracing::error!(?err, "error while checking deadlines");
            }
        }
    }

    async fn check_deadlines_if_leader(&self) -> Result<()> {
        if let Some(coordination) = &self.coordination {
            if !coordination.is_leader(CHECK_LEADER_SLOT).await? {
                return Ok(());
            }
        }

        self.check_deadlines().await
    }

    /// One full pass over all service configs.
    pub async fn check_deadlines(&self) -> Result<()> {
        let mut stream = self.store.service_configs();

        loop {
            tokio::select! {
                config = stream.configs.recv() => match config {
                    Some(service) => {
                        if let Err(err) = self.check_service(&service).await {
                            tracing::error!(service = %service.id, ?err, "failed to check deadline");
                        }
                    }
                    None => return Ok(()),
                },
                Some(err) = stream.errors.recv() => {
                    tracing::error!(?err, "error reading service configs");
                }
            }
        }
    }

    async fn check_service(&self, service: &ServiceConfig) -> Result<()> {
        let last_heartbeat = match self.store.last_heartbeat(&service.id).await {
            Ok(t) => t,
            // A service that has never pinged is overdue from the moment it
            // is registered; the first ping is what arms it as alive.
            Err(StoreError::NotFound) => DateTime::<Utc>::UNIX_EPOCH,
            Err(err) => return Err(err).context("failed to get last heartbeat"),
        };

        let timeout =
            chrono::Duration::from_std(service.timeout).context("service timeout out of range")?;

        if Utc::now() - last_heartbeat > timeout {
            tracing::info!(service = %service.id, "service is overdue");

            match self.store.alarm_active_since(&service.id).await {
                Err(StoreError::NotFound) => {
                    // Best effort; a failed write means the next tick tries
                    // again while alerts still go out.
                    if let Err(err) = self
                        .store
                        .set_alarm_active_since(&service.id, Utc::now())
                        .await
                    {
                        tracing::error!(service = %service.id, ?err, "failed to set alarm active state");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(service = %service.id, ?err, "failed to load alarm state");
                }
            }

            self.notifier.send_alerts(service).await?;
        } else {
            tracing::debug!(
                service = %service.id,
                last_heartbeat = %last_heartbeat,
                "service is considered alive"
            );
        }

        Ok(())
    }
}
