use crate::session::Session;
use async_trait::async_trait;
use etcd_client::LockOptions;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Slot the deadline checker campaigns on.
pub const CHECK_LEADER_SLOT: &str = "/deadman-switch/check-leader";

/// How long a single leadership campaign may block.
const CAMPAIGN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("coordination transport error: {0}")]
    Transport(String),
}

impl From<etcd_client::Error> for CoordinationError {
    fn from(err: etcd_client::Error) -> Self {
        CoordinationError::Transport(err.to_string())
    }
}

/// Cluster coordination: leader election on named slots and mutual
/// exclusion on named keys, all bound to the node's session lease.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Returns true when this node holds (or wins) the elected slot.
    ///
    /// An already-held slot returns true without re-campaigning. A campaign
    /// that exceeds its deadline returns false without error; only
    /// transport faults surface as errors.
    async fn is_leader(&self, slot: &str) -> Result<bool, CoordinationError>;

    /// Acquires a mutually exclusive lock on `key`. The lock is released
    /// when the guard drops; a lost lease implicitly drops it. Not
    /// reentrant per key within a session.
    async fn lock(&self, key: &str) -> Result<LockGuard, CoordinationError>;
}

pub struct EtcdCoordination {
    session: Session,
    node_id: String,
    held_slots: Mutex<Vec<String>>,
}

impl EtcdCoordination {
    pub fn new(session: Session, node_id: String) -> Self {
        Self {
            session,
            node_id,
            held_slots: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Coordination for EtcdCoordination {
    async fn is_leader(&self, slot: &str) -> Result<bool, CoordinationError> {
        let mut held = self.held_slots.lock().await;
        if held.iter().any(|h| h == slot) {
            return Ok(true);
        }

        let mut election = self.session.election_client();
        let campaign = election.campaign(slot, self.node_id.clone(), self.session.lease_id());

        match tokio::time::timeout(CAMPAIGN_TIMEOUT, campaign).await {
            Err(_elapsed) => Ok(false),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(_response)) => {
                tracing::info!(slot, node = %self.node_id, "won leadership");
                held.push(slot.to_string());
                Ok(true)
            }
        }
    }

    async fn lock(&self, key: &str) -> Result<LockGuard, CoordinationError> {
        acquire_lock(&self.session, key).await
    }
}

pub(crate) async fn acquire_lock(
    session: &Session,
    key: &str,
) -> Result<LockGuard, CoordinationError> {
    let mut lock = session.lock_client();
    let options = LockOptions::new().with_lease(session.lease_id());
    let response = lock.lock(key, Some(options)).await?;

    Ok(LockGuard {
        key: response.key().to_vec(),
        client: lock,
    })
}

/// Holds an acquired lock; unlocks on drop.
pub struct LockGuard {
    key: Vec<u8>,
    client: etcd_client::LockClient,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut client = self.client.clone();
        let key = std::mem::take(&mut self.key);
        tokio::spawn(async move {
            if let Err(err) = client.unlock(key).await {
                // Lease expiry reclaims the lock if this fails.
                tracing::warn!(?err, "failed to release lock");
            }
        });
    }
}
