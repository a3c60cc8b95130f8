use anyhow::{anyhow, Context, Result};
use clap::Parser;
use deadman_switch::checker::Checker;
use deadman_switch::config::{self, ServerConfig, StorageConfig};
use deadman_switch::coordination::{Coordination, EtcdCoordination};
use deadman_switch::init_tracing::{init_tracing, LogFormat};
use deadman_switch::notifier::Notifier;
use deadman_switch::queue::{EtcdQueue, Queue, QUEUE_PREFIX};
use deadman_switch::server::{self, AppState};
use deadman_switch::session::{Session, LEASE_TTL_SECONDS};
use deadman_switch::store::etcd::EtcdStorage;
use deadman_switch::store::memory::MemoryStorage;
use deadman_switch::store::Storage;
use deadman_switch::util::GuardHandle;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[clap(version, about = "Distributed dead-man's-switch watchdog")]
struct Opts {
    /// Path to the YAML or JSON config file.
    #[clap(long, short = 'c', default_value = "config.yaml")]
    config: PathBuf,

    #[clap(long, default_value = "info")]
    log_level: String,

    #[clap(long, default_value = "json", value_enum)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    init_tracing(&opts.log_level, opts.log_format)?;

    let config = config::load(&opts.config)?;
    run(config).await
}

struct Backends {
    store: Arc<dyn Storage>,
    coordination: Option<Arc<dyn Coordination>>,
    queue: Option<Arc<dyn Queue>>,
    lease_lost: Option<watch::Receiver<bool>>,
}

async fn connect_backends(config: &ServerConfig) -> Result<Backends> {
    match &config.storage {
        StorageConfig::Memory => Ok(Backends {
            store: Arc::new(MemoryStorage::new(config.services.clone())),
            coordination: None,
            queue: None,
            lease_lost: None,
        }),
        StorageConfig::Etcd(etcd_config) => {
            let client = etcd_client::Client::connect(etcd_config.endpoints.clone(), None)
                .await
                .with_context(|| {
                    format!("failed to connect to etcd at {:?}", etcd_config.endpoints)
                })?;

            let session = Session::new(client, LEASE_TTL_SECONDS)
                .await
                .context("failed to establish etcd session")?;

            let store = Arc::new(EtcdStorage::new(session.clone(), &etcd_config.prefix));

            // Locally-configured services are declared infrastructure and
            // win over stored configs with the same id; admin-created
            // services under other ids are untouched.
            for service in &config.services {
                store
                    .save_service_config(service.clone())
                    .await
                    .with_context(|| {
                        format!("failed to push local config for {} to etcd", service.id)
                    })?;
            }

            Ok(Backends {
                store,
                coordination: Some(Arc::new(EtcdCoordination::new(
                    session.clone(),
                    config.id.clone(),
                ))),
                queue: Some(Arc::new(EtcdQueue::new(session.clone(), QUEUE_PREFIX))),
                lease_lost: Some(session.lost()),
            })
        }
    }
}

async fn run(config: ServerConfig) -> Result<()> {
    let backends = connect_backends(&config).await?;

    let notifier = Notifier::new(backends.store.clone(), backends.queue);
    let _consumer = notifier.start_consumer();

    let checker = Checker::new(
        backends.store.clone(),
        backends.coordination,
        notifier.clone(),
        config.check_interval,
    );
    tracing::info!("start checking deadlines");
    let _checker = GuardHandle::new(checker.run());

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {:?}", config.listen))?;
    let state = Arc::new(AppState::new(
        backends.store,
        notifier,
        config.username,
        config.password,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_task = tokio::spawn(server::serve(state, addr, shutdown_rx));

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
            Ok(())
        }
        _ = wait_for_lost_lease(backends.lease_lost) => {
            Err(anyhow!("etcd lease lost, node can no longer coordinate"))
        }
        join = &mut server_task => {
            return match join? {
                Ok(()) => Err(anyhow!("server stopped unexpectedly")),
                Err(err) => Err(err),
            };
        }
    };

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(SHUTDOWN_DRAIN, server_task).await {
        Ok(join) => join??,
        Err(_) => tracing::warn!("server did not drain in time, exiting anyway"),
    }

    result
}

async fn wait_for_lost_lease(lost: Option<watch::Receiver<bool>>) {
    let Some(mut lost) = lost else {
        return std::future::pending().await;
    };

    while !*lost.borrow() {
        if lost.changed().await.is_err() {
            return;
        }
    }
}
