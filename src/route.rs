//! Compiled routes handed to the request router

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::checksum::Checksum;
use crate::service::ProtocolKey;

/// Transport a route is served on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    WebSocket,
}

/// Routable output of compiling one protocol over a branch's integrations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub protocol: ProtocolKey,
    pub transport: Transport,
    /// Path relative to the branch mount point
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Plugin specific handler description, opaque to the registry
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Route {
    pub fn new(protocol: ProtocolKey, transport: Transport, path: impl Into<String>) -> Self {
        Self {
            protocol,
            transport,
            path: path.into(),
            description: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transport = match self.transport {
            Transport::Http => "http",
            Transport::WebSocket => "ws",
        };
        write!(f, "({}) {} {}", self.protocol, transport, self.path)
    }
}

/// A route together with the hash identifying the input it was compiled from
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRoute {
    pub hash: Checksum,
    pub route: Arc<Route>,
}

impl CompiledRoute {
    pub fn new(hash: Checksum, route: Route) -> Self {
        Self {
            hash,
            route: Arc::new(route),
        }
    }
}

/// Routes of the latest version indexed by hash, so plugins can reuse
/// unchanged handlers instead of rebuilding them
#[derive(Debug, Clone, Default)]
pub struct RouteCache {
    routes: HashMap<Checksum, Arc<Route>>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache holding exactly the given routes
    pub fn from_routes(routes: &[CompiledRoute]) -> Self {
        Self {
            routes: routes
                .iter()
                .map(|compiled| (compiled.hash.clone(), compiled.route.clone()))
                .collect(),
        }
    }

    pub fn get(&self, hash: &Checksum) -> Option<Arc<Route>> {
        self.routes.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
