use crate::util::GuardHandle;
use etcd_client::{Client, LeaseKeepAliveStream, LeaseKeeper};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Lease TTL for one node's session.
pub const LEASE_TTL_SECONDS: i64 = 5;

/// One node's session against the replicated KV store: an etcd client plus
/// a short-TTL lease that a background loop keeps alive.
///
/// The lease is shared by the coordination client and the queue so that all
/// of a node's coordination state (election ballots, mutexes) evaporates
/// when the node dies. Domain records are deliberately not bound to it.
#[derive(Clone)]
pub struct Session {
    client: Client,
    lease_id: i64,
    lost: watch::Receiver<bool>,
    _keep_alive: Arc<GuardHandle>,
}

impl Session {
    pub async fn new(client: Client, ttl_seconds: i64) -> Result<Self, etcd_client::Error> {
        let mut lease = client.lease_client();
        let grant = lease.grant(ttl_seconds, None).await?;
        let lease_id = grant.id();

        let (keeper, stream) = lease.keep_alive(lease_id).await?;
        let (lost_tx, lost_rx) = watch::channel(false);
        let keep_alive = GuardHandle::new(keep_alive_loop(keeper, stream, ttl_seconds, lost_tx));

        tracing::debug!(lease_id, ttl_seconds, "established etcd session");

        Ok(Self {
            client,
            lease_id,
            lost: lost_rx,
            _keep_alive: Arc::new(keep_alive),
        })
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    /// Flips to `true` when the lease can no longer be kept alive. The node
    /// cannot coordinate past that point and must treat it as fatal.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost.clone()
    }

    pub fn kv_client(&self) -> etcd_client::KvClient {
        self.client.kv_client()
    }

    pub fn watch_client(&self) -> etcd_client::WatchClient {
        self.client.watch_client()
    }

    pub fn lock_client(&self) -> etcd_client::LockClient {
        self.client.lock_client()
    }

    pub fn election_client(&self) -> etcd_client::ElectionClient {
        self.client.election_client()
    }
}

async fn keep_alive_loop(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    ttl_seconds: i64,
    lost: watch::Sender<bool>,
) {
    // Refresh at a third of the TTL so a single dropped round trip does not
    // expire the lease.
    let interval = Duration::from_secs((ttl_seconds as u64 / 3).max(1));

    loop {
        tokio::time::sleep(interval).await;

        if let Err(err) = keeper.keep_alive().await {
            tracing::error!(?err, "failed to send lease keep-alive");
            break;
        }

        match stream.message().await {
            Ok(Some(response)) if response.ttl() > 0 => {}
            Ok(_) => {
                tracing::error!("lease expired or keep-alive stream closed");
                break;
            }
            Err(err) => {
                tracing::error!(?err, "lease keep-alive stream failed");
                break;
            }
        }
    }

    let _ = lost.send(true);
}
