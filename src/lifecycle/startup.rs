//! Startup orchestration.
//!
//! # Responsibilities
//! - Connect the coordination store
//! - Start every enabled role in dependency order
//! - Re-open sessions for roles that lose theirs
//! - Wait for shutdown, then leave gracefully within a deadline
//!
//! # Design Decisions
//! - Fail fast: store connection and listener binding errors are fatal
//! - Caches are filled once before roles that read them start
//! - Each session-bound role owns its session; closing it on the way out
//!   revokes its ephemeral entries so peers fail over at once
//! - The API listener starts last (answers only once state is loaded)

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::admin::Publisher;
use crate::cache::ConfigCache;
use crate::config::schema::{NodeConfig, StoreConfig};
use crate::discovery::{
    CommandAddressOwner, DiscoveryError, LbNodeRecord, NodeRegistration, Resolver, UdpHeartbeat,
    VipManager, VipStateMachine,
};
use crate::health::{HealthProbe, HttpProbe};
use crate::http::{ApiServer, AppState};
use crate::lifecycle::shutdown::Shutdown;
use crate::load_balancer::RoutingEngine;
use crate::orchestrator::{LeaderElection, LeadershipState, Supervisor, Worker, WorkerStatus};
use crate::resilience::Backoff;
use crate::store::{self, Session, StoreError, StoreHandle};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// A running control-plane process.
pub struct Node {
    node_id: String,
    store: StoreHandle,
    shutdown: Shutdown,
    tasks: JoinSet<()>,
    engine: Option<Arc<RoutingEngine>>,
    resolver: Option<Arc<Resolver>>,
    api_address: Option<SocketAddr>,
}

impl Node {
    /// Connect the configured store and start every enabled role.
    pub async fn start(config: NodeConfig, shutdown: Shutdown) -> Result<Self, StartupError> {
        let store = store::connect(&config.store).await?;
        Self::start_with_store(config, store, shutdown).await
    }

    /// Start every enabled role against an existing store handle.
    pub async fn start_with_store(
        config: NodeConfig,
        store: StoreHandle,
        shutdown: Shutdown,
    ) -> Result<Self, StartupError> {
        let node_id = config.node.id.clone();
        let store_config = config.store.clone();
        let mut tasks = JoinSet::new();
        let mut api_state = AppState::new(node_id.clone());

        tracing::info!(
            node_id = %node_id,
            store = ?store_config.backend,
            load_balancer = config.load_balancer.enabled,
            orchestrator = config.orchestrator.enabled,
            discovery = config.discovery.enabled,
            "Starting node"
        );

        // 1. Config cache (routing and probing both read it)
        let mut cache = None;
        let mut engine = None;
        if config.load_balancer.enabled || config.orchestrator.enabled {
            let c = Arc::new(ConfigCache::new(
                store.clone(),
                Duration::from_millis(config.load_balancer.reconcile_interval_ms),
                &store_config,
            ));
            if let Err(e) = c.refresh().await {
                tracing::warn!(error = %e, "Initial config load failed, serving empty table until the store answers");
            }
            let rx = shutdown.subscribe();
            let task_cache = c.clone();
            tasks.spawn(async move { task_cache.run(rx).await });
            engine = Some(Arc::new(RoutingEngine::new(c.clone())));
            api_state = api_state.with_cache(c.clone());
            cache = Some(c);
        }

        // 2. Group publisher
        if let Some(path) = config.publisher.groups_file.clone() {
            let publisher = Publisher::new(store.clone(), &store_config);
            let watch = config.publisher.watch;
            let rx = shutdown.subscribe();
            tasks.spawn(async move { publisher.run(path, watch, rx).await });
        }

        // 3. Health orchestrator (election + supervisor + worker on one session)
        if let Some(cache) = cache.clone().filter(|_| config.orchestrator.enabled) {
            let (leadership_tx, leadership_rx) = watch::channel(LeadershipState::NoLeader);
            let (worker_tx, worker_rx) = watch::channel(WorkerStatus {
                worker_id: node_id.clone(),
                ..WorkerStatus::default()
            });
            let leadership_tx = Arc::new(leadership_tx);
            let worker_tx = Arc::new(worker_tx);
            api_state = api_state.with_leadership(leadership_rx).with_worker(worker_rx);

            let orchestrator = config.orchestrator.clone();
            let cas = store_config.cas_max_attempts;
            let probe: Arc<dyn HealthProbe> = Arc::new(HttpProbe::new());
            let id = node_id.clone();
            let task_store = store.clone();
            tasks.spawn(with_session(
                "orchestrator",
                store.clone(),
                store_config.clone(),
                shutdown.clone(),
                move |session, shutdown| {
                    let orchestrator = orchestrator.clone();
                    let election = LeaderElection::new(
                        id.clone(),
                        session.clone(),
                        Duration::from_millis(orchestrator.reassign_interval_ms),
                    );
                    let supervisor = Supervisor::new(task_store.clone(), orchestrator.clone(), cas)
                        .with_cache(cache.clone());
                    let mut worker = Worker::new(
                        id.clone(),
                        session,
                        cache.clone(),
                        probe.clone(),
                        orchestrator,
                        cas,
                    );
                    let leadership_tx = leadership_tx.clone();
                    let worker_tx = worker_tx.clone();
                    async move {
                        let leadership = election.subscribe();
                        let status = worker.subscribe();
                        let result = tokio::select! {
                            res = election.run(shutdown.resubscribe()) => res,
                            res = worker.run(shutdown.resubscribe()) => res,
                            _ = supervisor.run(election.subscribe(), shutdown.resubscribe()) => Ok(()),
                            _ = mirror(leadership, &*leadership_tx) => Ok(()),
                            _ = mirror(status, &*worker_tx) => Ok(()),
                        };
                        leadership_tx.send_replace(LeadershipState::NoLeader);
                        result
                    }
                },
            ));
        }

        // 4. LB node registration
        if config.load_balancer.enabled {
            let record = LbNodeRecord {
                node_id: node_id.clone(),
                address: config.load_balancer.advertise_address.clone(),
                locality: config.node.locality.clone(),
                weight: config.load_balancer.weight,
            };
            let recheck = Duration::from_millis(config.load_balancer.reconcile_interval_ms);
            tasks.spawn(with_session(
                "registration",
                store.clone(),
                store_config.clone(),
                shutdown.clone(),
                move |session, shutdown| {
                    let registration = NodeRegistration::new(session, record.clone(), recheck);
                    async move { registration.run(shutdown).await }
                },
            ));
        }

        // 5. Discovery: resolver and shared address
        let mut resolver = None;
        if config.discovery.enabled {
            let r = Arc::new(Resolver::new(store.clone(), &config.discovery, &store_config));
            if let Err(e) = r.refresh().await {
                tracing::warn!(error = %e, "Initial fleet load failed");
            }
            let rx = shutdown.subscribe();
            let task_resolver = r.clone();
            tasks.spawn(async move { task_resolver.run(rx).await });
            api_state = api_state.with_resolver(r.clone());
            resolver = Some(r);

            if let Some(vip) = &config.discovery.vip {
                let channel = Arc::new(UdpHeartbeat::bind(&vip.bind_address, &vip.peers).await?);
                let owner = Arc::new(CommandAddressOwner::new(
                    vip.acquire_command.clone(),
                    vip.release_command.clone(),
                ));
                let machine = VipStateMachine::new(node_id.clone(), vip.priority, vip.missed_heartbeats);
                let mut manager = VipManager::new(
                    machine,
                    vip.address.clone(),
                    Duration::from_millis(vip.heartbeat_interval_ms),
                    channel,
                    owner,
                );
                api_state = api_state.with_vip(manager.subscribe());
                let rx = shutdown.subscribe();
                tasks.spawn(async move { manager.run(rx).await });
            }
        }

        // 6. API, last
        let mut api_address = None;
        if config.api.enabled {
            let listener = TcpListener::bind(&config.api.bind_address).await?;
            api_address = Some(listener.local_addr()?);
            let server = ApiServer::new(api_state);
            let rx = shutdown.subscribe();
            tasks.spawn(async move {
                if let Err(e) = server.run(listener, rx).await {
                    tracing::error!(error = %e, "API server failed");
                }
            });
        }

        tracing::info!(node_id = %node_id, api = ?api_address, "Node started");
        Ok(Self {
            node_id,
            store,
            shutdown,
            tasks,
            engine,
            resolver,
            api_address,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Routing engine, when the load-balancer role runs.
    pub fn engine(&self) -> Option<&Arc<RoutingEngine>> {
        self.engine.as_ref()
    }

    pub fn resolver(&self) -> Option<&Arc<Resolver>> {
        self.resolver.as_ref()
    }

    /// Bound address of the API listener.
    pub fn api_address(&self) -> Option<SocketAddr> {
        self.api_address
    }

    /// Trigger shutdown and wait for every role to leave.
    pub async fn stop(self, grace: Duration) {
        self.shutdown.trigger();
        self.wait(grace).await;
    }

    /// Wait for shutdown, then give the roles `grace` to finish.
    pub async fn wait(mut self, grace: Duration) {
        let mut rx = self.shutdown.subscribe();
        if !self.shutdown.is_triggered() {
            let _ = rx.recv().await;
        }

        let drain = async {
            while let Some(res) = self.tasks.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Task panicked during shutdown");
                    }
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!(remaining = self.tasks.len(), "Shutdown deadline reached, aborting tasks");
            self.tasks.abort_all();
        }
        tracing::info!(node_id = %self.node_id, "Node stopped");
    }
}

/// Copy every value of `rx` into `tx` until `rx`'s sender goes away.
async fn mirror<T: Clone>(mut rx: watch::Receiver<T>, tx: &watch::Sender<T>) {
    loop {
        tx.send_replace(rx.borrow_and_update().clone());
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run a session-bound role, re-opening the session whenever it is lost.
///
/// The role returns `Ok` on shutdown; the session is then closed so its
/// ephemeral entries vanish immediately.
async fn with_session<F, Fut, E>(
    role: &'static str,
    store: StoreHandle,
    config: StoreConfig,
    shutdown: Shutdown,
    mut start: F,
) where
    F: FnMut(Arc<Session>, broadcast::Receiver<()>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: std::fmt::Display + Send,
{
    let ttl = Duration::from_millis(config.session_ttl_ms);
    let mut backoff = Backoff::for_store(&config);

    while !shutdown.is_triggered() {
        let mut rx = shutdown.subscribe();
        let session = match Session::open(store.clone(), ttl).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(role, error = %e, delay = ?delay, "Failed to open session, retrying");
                tokio::select! {
                    _ = sleep(delay) => continue,
                    _ = rx.recv() => break,
                }
            }
        };
        backoff.reset();

        let result = start(session.clone(), shutdown.subscribe()).await;
        if let Err(e) = session.close().await {
            tracing::debug!(role, error = %e, "Session close failed");
        }
        match result {
            Ok(()) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(role, error = %e, delay = ?delay, "Role stopped, re-opening session");
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = rx.recv() => break,
                }
            }
        }
    }
    tracing::info!(role, "Role stopped");
}
