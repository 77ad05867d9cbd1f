//! Composed schema versions

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::checksum::Checksum;
use crate::integration::{Integration, IntegrationSummary};
use crate::route::CompiledRoute;
use crate::service::Service;

/// An immutable snapshot of a branch's composed schema
///
/// Only the integration history is appended to after construction: it records
/// every attempt that was resolved while this version was the branch's latest.
#[derive(Debug)]
pub struct Version {
    branch: String,
    number: u64,
    integrations: Vec<Arc<Integration>>,
    routes: Vec<CompiledRoute>,
    parent: Option<Weak<Version>>,
    parent_number: Option<u64>,
    created_at: DateTime<Utc>,
    history: Mutex<Vec<Arc<Integration>>>,
}

impl Version {
    /// The empty version a branch starts from
    pub(crate) fn root(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            number: 0,
            integrations: Vec::new(),
            routes: Vec::new(),
            parent: None,
            parent_number: None,
            created_at: Utc::now(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// A successor of `parent` composed from the given integrations
    pub(crate) fn next(
        parent: &Arc<Version>,
        integrations: Vec<Arc<Integration>>,
        routes: Vec<CompiledRoute>,
    ) -> Self {
        Self {
            branch: parent.branch.clone(),
            number: parent.number + 1,
            integrations,
            routes,
            parent: Some(Arc::downgrade(parent)),
            parent_number: Some(parent.number),
            created_at: Utc::now(),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Position in the branch's version chain, the root being 0
    pub fn number(&self) -> u64 {
        self.number
    }

    /// The successful integrations composing this version
    pub fn integrations(&self) -> &[Arc<Integration>] {
        &self.integrations
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    /// The predecessor, while it is still retained by the branch history or a caller
    pub fn parent_version(&self) -> Option<Arc<Version>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn parent_number(&self) -> Option<u64> {
        self.parent_number
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Services composing this version, in integration order
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.integrations.iter().map(|i| i.service().clone()).collect()
    }

    /// The integration that brought the given service into this version
    pub fn find_integration(&self, service_id: &str) -> Option<&Arc<Integration>> {
        self.integrations.iter().find(|i| i.service().id == service_id)
    }

    /// Combined hash of every route, identifying the composed output
    pub fn routes_hash(&self) -> Checksum {
        Checksum::combine(self.routes.iter().map(|r| &r.hash))
    }

    /// Record a resolved attempt against this version
    pub fn add_integration_history(&self, integration: Arc<Integration>) {
        debug_assert!(integration.is_resolved());
        self.history.lock().push(integration);
    }

    pub fn integration_history(&self) -> Vec<Arc<Integration>> {
        self.history.lock().clone()
    }

    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            branch: self.branch.clone(),
            number: self.number,
            parent: self.parent_number,
            created_at: self.created_at,
            services: self.integrations.iter().map(|i| i.service().id.clone()).collect(),
            routes: self.routes.iter().map(|r| r.route.to_string()).collect(),
            history: self.history.lock().iter().map(|i| i.summary()).collect(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.branch, self.number)
    }
}

/// Serializable view of a version for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSummary {
    pub branch: String,
    pub number: u64,
    pub parent: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub services: Vec<String>,
    pub routes: Vec<String>,
    pub history: Vec<IntegrationSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Route, Transport};
    use crate::service::{ProtocolKey, ServiceSchema};

    fn succeeded(id: &str) -> Arc<Integration> {
        let service = Service::new(id, "master", ServiceSchema::new());
        Arc::new(Integration::add(Arc::new(service)).succeed())
    }

    #[test]
    fn test_version_chain() {
        let root = Arc::new(Version::root("master"));
        let route = CompiledRoute::new(
            Checksum::from_text("a"),
            Route::new(ProtocolKey::Rest, Transport::Http, "/a"),
        );
        let next = Arc::new(Version::next(&root, vec![succeeded("a")], vec![route]));

        assert_eq!(root.to_string(), "master@v0");
        assert_eq!(next.to_string(), "master@v1");
        assert_eq!(next.parent_number(), Some(0));
        assert!(Arc::ptr_eq(&next.parent_version().unwrap(), &root));
        assert_eq!(next.services()[0].id, "a");
        assert!(next.find_integration("a").is_some());
        assert!(next.find_integration("b").is_none());
    }

    #[test]
    fn test_parent_is_released_with_history() {
        let root = Arc::new(Version::root("master"));
        let next = Version::next(&root, vec![], vec![]);
        drop(root);

        assert!(next.parent_version().is_none());
        assert_eq!(next.parent_number(), Some(0));
    }

    #[test]
    fn test_history_is_append_only() {
        let version = Version::root("master");
        let failed = Arc::new(Integration::add(succeeded("a").service().clone()).fail(vec![]));
        version.add_integration_history(failed.clone());
        version.add_integration_history(succeeded("b"));

        let history = version.integration_history();
        assert_eq!(history.len(), 2);
        assert!(Arc::ptr_eq(&history[0], &failed));

        let summary = version.summary();
        assert_eq!(summary.history.len(), 2);
        assert_eq!(summary.number, 0);
    }
}
