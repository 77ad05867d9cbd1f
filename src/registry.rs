//! Schema Registry
//!
//! Process-wide directory of branches. Routes discovery events to the branch
//! each service declares, creating branches lazily, and evicts branches that
//! stayed without services for longer than the configured grace period.

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::branch::{Branch, BranchEvent};
use crate::config::GatewayConfig;
use crate::discovery::{DiscoveryEvent, ServiceDiscovery};
use crate::error::{RegistryError, Result};
use crate::plugin::ProtocolPlugins;

/// Hooks the serving layer registers to follow branch changes
#[async_trait]
pub trait RegistryListener: Send + Sync {
    /// A new latest version was produced for the branch
    async fn updated(&self, branch: Arc<Branch>);

    /// The branch no longer has any service
    async fn removed(&self, branch: Arc<Branch>);
}

struct RegistryInner {
    config: GatewayConfig,
    plugins: Arc<ProtocolPlugins>,
    branches: RwLock<HashMap<String, Arc<Branch>>>,
    listener: RwLock<Option<Arc<dyn RegistryListener>>>,
}

/// The main schema registry
pub struct SchemaRegistry {
    inner: Arc<RegistryInner>,
    discoveries: Vec<Arc<dyn ServiceDiscovery>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl SchemaRegistry {
    pub fn new(config: GatewayConfig, plugins: ProtocolPlugins) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(RegistryInner {
                config,
                plugins: Arc::new(plugins),
                branches: RwLock::new(HashMap::new()),
                listener: RwLock::new(None),
            }),
            discoveries: Vec::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Add a discovery source; every source is subscribed on `start()`
    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discoveries.push(discovery);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to every discovery source and begin routing.
    ///
    /// Fails if a plugin or a discovery source cannot be started; sources
    /// started before the failure are stopped again.
    pub async fn start(&self, listener: Arc<dyn RegistryListener>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::AlreadyStarted);
        }
        if let Err(e) = self.inner.config.validate() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        *self.inner.listener.write() = Some(listener);
        self.shutdown_tx.send_replace(false);

        if let Err(e) = self.inner.plugins.start().await {
            self.abort_start().await;
            return Err(e);
        }

        let mut streams = Vec::with_capacity(self.discoveries.len());
        for (index, discovery) in self.discoveries.iter().enumerate() {
            match discovery.start().await {
                Ok(events) => streams.push((discovery.name().to_string(), events)),
                Err(e) => {
                    warn!(source = %discovery.name(), error = %e, "failed to start discovery source");
                    for started in &self.discoveries[..index] {
                        if let Err(e) = started.stop().await {
                            warn!(source = %started.name(), error = %e, "failed to stop discovery source");
                        }
                    }
                    self.abort_start().await;
                    return Err(e);
                }
            }
        }

        let mut tasks = self.tasks.lock();
        for (source, events) in streams {
            tasks.push(tokio::spawn(route_events(
                self.inner.clone(),
                source,
                events,
                self.shutdown_tx.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(sweep_branches(
            self.inner.clone(),
            self.shutdown_tx.subscribe(),
        )));

        info!(
            sources = self.discoveries.len(),
            protocols = ?self.inner.plugins.keys().collect::<Vec<_>>(),
            "schema registry has been started"
        );
        Ok(())
    }

    async fn abort_start(&self) {
        if let Err(e) = self.inner.plugins.stop().await {
            warn!(error = %e, "failed to stop protocol plugins");
        }
        self.inner.listener.write().take();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Unsubscribe from discovery, stop every branch and release resources
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "registry task ended abnormally");
            }
        }

        for discovery in &self.discoveries {
            if let Err(e) = discovery.stop().await {
                warn!(source = %discovery.name(), error = %e, "failed to stop discovery source");
            }
        }

        // without a listener no new branch can be spawned behind the drain
        self.inner.listener.write().take();
        let branches: Vec<Arc<Branch>> = self.inner.branches.write().drain().map(|(_, b)| b).collect();
        join_all(branches.iter().map(|branch| branch.stop())).await;

        self.inner.plugins.stop().await?;
        info!(branches = branches.len(), "schema registry has been stopped");
        Ok(())
    }

    /// Look up a branch by name
    pub fn get_branch(&self, name: &str) -> Option<Arc<Branch>> {
        self.inner.branches.read().get(name).cloned()
    }

    /// Names of every live branch, sorted
    pub fn branch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.branches.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Route a discovery event as if a discovery source had emitted it
    pub fn dispatch(&self, event: DiscoveryEvent) -> Result<()> {
        if !self.is_running() {
            return Err(RegistryError::NotStarted);
        }
        self.inner.route(event)
    }

    /// Evict every branch that has been unused for longer than the grace period
    pub async fn sweep_unused(&self) -> Vec<String> {
        self.inner.sweep().await
    }
}

impl RegistryInner {
    fn route(self: &Arc<Self>, event: DiscoveryEvent) -> Result<()> {
        match event {
            DiscoveryEvent::Connected(service) => {
                let name = service.branch.clone();
                self.enqueue_or_create(&name, BranchEvent::Connected(Arc::new(service)))
            }
            DiscoveryEvent::Disconnected { service, origin } => {
                let name = service.branch.clone();
                let branches = self.branches.read();
                match branches.get(&name) {
                    Some(branch) => {
                        let depth = branch.enqueue(BranchEvent::Disconnected {
                            service: Arc::new(service),
                            origin,
                        })?;
                        self.check_depth(branch, depth);
                        Ok(())
                    }
                    None => {
                        debug!(branch = %name, service = %service, "ignored disconnect for unknown branch");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Enqueue on an existing branch, creating it first if needed.
    ///
    /// The map lock is held while enqueueing so the sweep cannot evict the
    /// branch between lookup and enqueue.
    fn enqueue_or_create(self: &Arc<Self>, name: &str, event: BranchEvent) -> Result<()> {
        {
            let branches = self.branches.read();
            if let Some(branch) = branches.get(name) {
                let depth = branch.enqueue(event)?;
                self.check_depth(branch, depth);
                return Ok(());
            }
        }

        let mut branches = self.branches.write();
        let branch = match branches.get(name) {
            Some(branch) => branch.clone(),
            None => {
                let branch = self.spawn_branch(name)?;
                branches.insert(name.to_string(), branch.clone());
                branch
            }
        };
        let depth = branch.enqueue(event)?;
        self.check_depth(&branch, depth);
        Ok(())
    }

    fn spawn_branch(self: &Arc<Self>, name: &str) -> Result<Arc<Branch>> {
        let listener = self
            .listener
            .read()
            .clone()
            .ok_or(RegistryError::NotStarted)?;
        let branch = Arc::new(Branch::new(name, self.config.branch.clone(), self.plugins.clone()));
        let inbox = branch.open_inbox();
        let worker = tokio::spawn(run_branch(branch.clone(), inbox, listener));
        branch.set_worker(worker);
        info!(branch = %name, "branch has been created");
        Ok(branch)
    }

    fn check_depth(&self, branch: &Branch, depth: usize) {
        if depth > self.config.registry.inbox_warn_depth {
            warn!(branch = %branch, queued = depth, "branch inbox is backing up");
        }
    }

    async fn sweep(&self) -> Vec<String> {
        let max_unused = self.config.branch.max_unused();
        let evicted: Vec<Arc<Branch>> = {
            let mut branches = self.branches.write();
            let names: Vec<String> = branches
                .iter()
                .filter(|(_, branch)| branch.is_evictable(max_unused))
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|name| branches.remove(name)).collect()
        };

        let mut names = Vec::with_capacity(evicted.len());
        for branch in evicted {
            branch.stop().await;
            info!(branch = %branch, "unused branch has been evicted");
            names.push(branch.name().to_string());
        }
        names
    }
}

/// Forward one discovery source's events until shutdown or end of stream
async fn route_events(
    inner: Arc<RegistryInner>,
    source: String,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = inner.route(event) {
                        warn!(source = %source, error = %e, "failed to route discovery event");
                    }
                }
                None => {
                    warn!(source = %source, "discovery stream closed, branches keep their current state");
                    break;
                }
            },
        }
    }
}

/// Periodically evict unused branches until shutdown
async fn sweep_branches(inner: Arc<RegistryInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.config.registry.sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                let evicted = inner.sweep().await;
                if !evicted.is_empty() {
                    debug!(evicted = ?evicted, "branch sweep finished");
                }
            }
        }
    }
}

/// Marks the event as handled when dropped, unwinding included
struct EventDone<'a>(&'a Branch);

impl Drop for EventDone<'_> {
    fn drop(&mut self) {
        self.0.finish_event();
    }
}

/// Drain a branch inbox in order, notifying the listener after each event.
///
/// A panic in composition or in a listener hook is logged and the worker
/// moves on to the next event.
async fn run_branch(
    branch: Arc<Branch>,
    mut inbox: mpsc::UnboundedReceiver<BranchEvent>,
    listener: Arc<dyn RegistryListener>,
) {
    while let Some(event) = inbox.recv().await {
        let _done = EventDone(&branch);
        let update = match AssertUnwindSafe(branch.process(event)).catch_unwind().await {
            Ok(update) => update,
            Err(_) => {
                error!(branch = %branch, "branch composition panicked, event dropped");
                continue;
            }
        };
        for _ in &update.versions {
            notify(&branch, "updated", listener.updated(branch.clone())).await;
        }
        if update.emptied {
            notify(&branch, "removed", listener.removed(branch.clone())).await;
        }
    }
    debug!(branch = %branch, "branch worker has been stopped");
}

async fn notify(branch: &Branch, hook: &str, call: impl Future<Output = ()>) {
    if AssertUnwindSafe(call).catch_unwind().await.is_err() {
        warn!(branch = %branch, hook, "registry listener panicked");
    }
}
