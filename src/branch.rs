//! Branch composition engine
//!
//! A [`Branch`] owns the composed schema of one deployment target. Discovery
//! events for the branch are processed one at a time in arrival order: each
//! attempt builds a candidate set from the latest version, hands it to the
//! protocol plugins and either links a new [`Version`] or records the failure
//! and keeps the integration pending.
//!
//! Pending failed integrations are retried, oldest first, after every event
//! that succeeded or was skipped. A retry that succeeds produces its own
//! version and triggers another pass, so an integration waiting on a type that
//! arrives later converges regardless of arrival order.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BranchConfig;
use crate::error::{RegistryError, Result};
use crate::integration::{Integration, IntegrationKind, IntegrationStatus, IntegrationSummary};
use crate::plugin::ProtocolPlugins;
use crate::route::RouteCache;
use crate::service::Service;
use crate::version::{Version, VersionSummary};

/// An event queued on a branch
#[derive(Debug, Clone)]
pub enum BranchEvent {
    Connected(Arc<Service>),
    Disconnected { service: Arc<Service>, origin: String },
}

impl BranchEvent {
    pub fn service(&self) -> &Arc<Service> {
        match self {
            BranchEvent::Connected(service) => service,
            BranchEvent::Disconnected { service, .. } => service,
        }
    }
}

/// What processing one event changed on a branch
#[derive(Debug, Default)]
pub struct BranchUpdate {
    /// The resolved attempt for the event itself; `None` when the event was ignored
    pub integration: Option<Arc<Integration>>,
    /// Resolved retries of pending integrations, in the order they ran
    pub retried: Vec<Arc<Integration>>,
    /// Versions that became latest while processing, oldest first
    pub versions: Vec<Arc<Version>>,
    /// The service set went from non-empty to empty
    pub emptied: bool,
}

impl BranchUpdate {
    pub fn status(&self) -> Option<IntegrationStatus> {
        self.integration.as_ref().map(|i| i.status())
    }

    pub fn is_updated(&self) -> bool {
        !self.versions.is_empty()
    }
}

/// Outcome of a single composition attempt
struct Attempt {
    integration: Arc<Integration>,
    version: Option<Arc<Version>>,
}

struct BranchState {
    latest: Arc<Version>,
    history: VecDeque<Arc<Version>>,
    /// Failed integrations awaiting a retry, at most one per service id
    pending: Vec<Arc<Integration>>,
    route_cache: Arc<RouteCache>,
    empty_since: Option<Instant>,
    last_activity: DateTime<Utc>,
}

/// One named, independently versioned composition target
pub struct Branch {
    name: String,
    config: BranchConfig,
    plugins: Arc<ProtocolPlugins>,
    state: RwLock<BranchState>,
    /// Serializes composition attempts
    compose_lock: tokio::sync::Mutex<()>,
    inbox: Mutex<Option<mpsc::UnboundedSender<BranchEvent>>>,
    /// Events enqueued but not yet fully processed, in-flight one included
    queued: AtomicUsize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Branch {
    pub fn new(name: impl Into<String>, config: BranchConfig, plugins: Arc<ProtocolPlugins>) -> Self {
        let name = name.into();
        let root = Arc::new(Version::root(name.clone()));
        Self {
            name,
            config,
            plugins,
            state: RwLock::new(BranchState {
                latest: root.clone(),
                history: VecDeque::from([root]),
                pending: Vec::new(),
                route_cache: Arc::new(RouteCache::new()),
                empty_since: Some(Instant::now()),
                last_activity: Utc::now(),
            }),
            compose_lock: tokio::sync::Mutex::new(()),
            inbox: Mutex::new(None),
            queued: AtomicUsize::new(0),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn latest_version(&self) -> Arc<Version> {
        self.state.read().latest.clone()
    }

    /// Services of the latest version, in the order they were integrated
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.state.read().latest.services()
    }

    /// Retained versions, oldest first
    pub fn version_history(&self) -> Vec<Arc<Version>> {
        self.state.read().history.iter().cloned().collect()
    }

    /// Failed integrations that will be retried, in arrival order
    pub fn pending_integrations(&self) -> Vec<Arc<Integration>> {
        self.state.read().pending.clone()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state.read().last_activity
    }

    /// Number of events queued or in flight
    pub fn queued_events(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// No event is queued or being composed
    pub fn is_idle(&self) -> bool {
        self.queued_events() == 0
    }

    /// The branch has had no services for longer than `max_unused` and nothing is in flight
    pub fn is_evictable(&self, max_unused: Duration) -> bool {
        if !self.is_idle() {
            return false;
        }
        let state = self.state.read();
        state.latest.integrations().is_empty()
            && state
                .empty_since
                .map(|since| since.elapsed() >= max_unused)
                .unwrap_or(false)
    }

    pub fn summary(&self) -> BranchSummary {
        let state = self.state.read();
        BranchSummary {
            name: self.name.clone(),
            services: state.latest.services().iter().map(|s| s.id.clone()).collect(),
            latest: state.latest.summary(),
            history_depth: state.history.len(),
            pending: state.pending.iter().map(|i| i.summary()).collect(),
            queued_events: self.queued_events(),
            last_activity: state.last_activity,
        }
    }

    // ========================================================================
    // Inbox
    // ========================================================================

    /// Open the branch inbox; the returned receiver is drained by the branch worker
    pub(crate) fn open_inbox(&self) -> mpsc::UnboundedReceiver<BranchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbox.lock() = Some(tx);
        rx
    }

    pub(crate) fn set_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock() = Some(handle);
    }

    /// Queue an event behind every event already queued on this branch
    pub fn enqueue(&self, event: BranchEvent) -> Result<usize> {
        let inbox = self.inbox.lock();
        let sender = inbox
            .as_ref()
            .ok_or_else(|| RegistryError::BranchStopped(self.name.clone()))?;
        let depth = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if sender.send(event).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(RegistryError::BranchStopped(self.name.clone()));
        }
        Ok(depth)
    }

    /// Mark the oldest queued event as fully handled
    pub(crate) fn finish_event(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    /// Close the inbox and wait for the worker to drain what was already queued
    pub async fn stop(&self) {
        self.inbox.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(branch = %self.name, error = %e, "branch worker ended abnormally");
            }
        }
    }

    // ========================================================================
    // Composition
    // ========================================================================

    /// Process one event to completion.
    ///
    /// Calls are serialized: a second call waits until the first one has
    /// resolved, retries included.
    pub async fn process(&self, event: BranchEvent) -> BranchUpdate {
        let _guard = self.compose_lock.lock().await;
        let was_empty = self.latest_version().integrations().is_empty();
        let mut update = BranchUpdate::default();

        match event {
            BranchEvent::Connected(service) => {
                self.integrate_add(Integration::add(service), &mut update).await;
            }
            BranchEvent::Disconnected { service, origin } => {
                debug!(branch = %self.name, service = %service, origin = %origin, "service disconnected");
                self.integrate_remove(Integration::remove(service), &mut update).await;
            }
        }

        let mut state = self.state.write();
        state.last_activity = Utc::now();
        let is_empty = state.latest.integrations().is_empty();
        if !is_empty {
            state.empty_since = None;
        } else if state.empty_since.is_none() {
            state.empty_since = Some(Instant::now());
        }
        update.emptied = !was_empty && is_empty;
        update
    }

    async fn integrate_add(&self, integration: Integration, update: &mut BranchUpdate) {
        let latest = self.latest_version();
        let unchanged = latest
            .find_integration(&integration.service().id)
            .map(|current| current.schema_hash() == integration.schema_hash())
            .unwrap_or(false);

        if unchanged {
            let skipped = Arc::new(integration.skip());
            latest.add_integration_history(skipped.clone());
            skipped.report(&latest);
            self.discard_pending(&skipped.service().id);
            update.integration = Some(skipped);
            self.retry_pending(update).await;
            return;
        }

        self.settle(integration, update).await;
    }

    async fn integrate_remove(&self, integration: Integration, update: &mut BranchUpdate) {
        let service_id = integration.service().id.clone();
        if self.latest_version().find_integration(&service_id).is_none() {
            // never integrated: nothing to compose, only forget its pending attempt
            if self.discard_pending(&service_id) {
                info!(
                    branch = %self.name,
                    version = %self.latest_version(),
                    service = %integration.service(),
                    "discarded pending integration of disconnected service"
                );
            } else {
                debug!(branch = %self.name, service = %integration.service(), "ignored removal of unknown service");
            }
            return;
        }

        self.settle(integration, update).await;
    }

    /// Attempt the event's own integration and bookkeep its outcome
    async fn settle(&self, integration: Integration, update: &mut BranchUpdate) {
        let attempt = self.attempt(integration).await;
        update.integration = Some(attempt.integration.clone());

        match attempt.version {
            Some(version) => {
                self.discard_pending(&attempt.integration.service().id);
                update.versions.push(version);
                self.retry_pending(update).await;
            }
            None => {
                let service_id = attempt.integration.service().id.clone();
                let mut state = self.state.write();
                state.pending.retain(|p| p.service().id != service_id);
                state.pending.push(attempt.integration);
            }
        }
    }

    /// Retry pending integrations until a full pass yields no new version
    async fn retry_pending(&self, update: &mut BranchUpdate) {
        loop {
            let pending = self.pending_integrations();
            if pending.is_empty() {
                return;
            }

            let mut progressed = false;
            for failed in pending {
                let service_id = failed.service().id.clone();
                if failed.kind() == IntegrationKind::Remove
                    && self.latest_version().find_integration(&service_id).is_none()
                {
                    self.discard_pending(&service_id);
                    continue;
                }

                debug!(branch = %self.name, integration = %failed, "retrying failed integration");
                let attempt = self.attempt(failed.retry()).await;
                update.retried.push(attempt.integration.clone());

                match attempt.version {
                    Some(version) => {
                        self.discard_pending(&service_id);
                        update.versions.push(version);
                        progressed = true;
                    }
                    None => {
                        let mut state = self.state.write();
                        if let Some(slot) = state.pending.iter_mut().find(|p| p.service().id == service_id) {
                            *slot = attempt.integration;
                        }
                    }
                }
            }

            if !progressed {
                return;
            }
        }
    }

    /// Validate and compile the candidate set for one queued integration
    async fn attempt(&self, integration: Integration) -> Attempt {
        let latest = self.latest_version();
        let service_id = integration.service().id.clone();
        let kind = integration.kind();

        let mut candidate: Vec<Arc<Integration>> = latest
            .integrations()
            .iter()
            .filter(|i| i.service().id != service_id)
            .cloned()
            .collect();

        let mut errors = match kind {
            IntegrationKind::Add => self.plugins.validate(&integration.service().schema),
            IntegrationKind::Remove => Vec::new(),
        };

        let mut routes = Vec::new();
        if errors.is_empty() {
            let queued = Arc::new(integration.clone());
            let mut compiling = candidate.clone();
            if kind == IntegrationKind::Add {
                compiling.push(queued);
            }
            let cache = self.state.read().route_cache.clone();
            match self.plugins.compile(&cache, &compiling, &self.name).await {
                Ok(compiled) => routes = compiled,
                Err(compile_errors) => errors = compile_errors,
            }
        }

        if !errors.is_empty() {
            let failed = Arc::new(integration.fail(errors));
            latest.add_integration_history(failed.clone());
            failed.report(&latest);
            return Attempt {
                integration: failed,
                version: None,
            };
        }

        let succeeded = Arc::new(integration.succeed());
        if kind == IntegrationKind::Add {
            candidate.push(succeeded.clone());
        }
        let version = Arc::new(Version::next(&latest, candidate, routes));
        version.add_integration_history(succeeded.clone());
        self.install(version.clone());
        succeeded.report(&version);

        Attempt {
            integration: succeeded,
            version: Some(version),
        }
    }

    /// Make a version latest and trim the history to `max_versions`
    fn install(&self, version: Arc<Version>) {
        let max_versions = self.config.max_versions.max(1);
        let mut state = self.state.write();
        state.route_cache = Arc::new(RouteCache::from_routes(version.routes()));
        state.history.push_back(version.clone());
        while state.history.len() > max_versions {
            if let Some(evicted) = state.history.pop_front() {
                debug!(branch = %self.name, version = %evicted, "version evicted from history");
            }
        }
        state.latest = version;
    }

    /// Drop the pending integration of a service; true if there was one
    fn discard_pending(&self, service_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.pending.len();
        state.pending.retain(|p| p.service().id != service_id);
        before != state.pending.len()
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("name", &self.name)
            .field("latest", &self.latest_version().to_string())
            .field("queued", &self.queued_events())
            .finish()
    }
}

/// Serializable view of a branch for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSummary {
    pub name: String,
    pub services: Vec<String>,
    pub latest: VersionSummary,
    pub history_depth: usize,
    pub pending: Vec<IntegrationSummary>,
    pub queued_events: usize,
    pub last_activity: DateTime<Utc>,
}
