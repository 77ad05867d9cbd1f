//! Shared fixtures for registry tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use gateway_schemas::{
    Branch, Checksum, CompiledRoute, DiscoveryEvent, GatewayConfig, Integration, LocalDiscovery, ProtocolKey,
    ProtocolPlugin, ProtocolPlugins, RegistryListener, Route, RouteCache, SchemaRegistry, Service,
    ServiceSchema, Transport, ValidationError,
};

/// GraphQL stand-in: fragments declare the types they define and reference,
/// and a set compiles only when every reference is defined exactly once.
#[derive(Default)]
pub struct TypeRefPlugin {
    /// Compilation of a set containing this service id waits for `gate`
    pub gated_service: Option<String>,
    pub gate: Arc<Notify>,
}

impl TypeRefPlugin {
    pub fn gated(service_id: &str) -> Self {
        Self {
            gated_service: Some(service_id.to_string()),
            gate: Arc::new(Notify::new()),
        }
    }
}

fn names(fragment: &serde_json::Value, key: &str) -> Vec<String> {
    fragment
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|i| i.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

#[async_trait]
impl ProtocolPlugin for TypeRefPlugin {
    fn key(&self) -> ProtocolKey {
        ProtocolKey::GraphQl
    }

    fn validate_schema(&self, fragment: &serde_json::Value) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !fragment.is_object() {
            return vec![ValidationError::new("", "typeDefsSyntax", "fragment must be an object")];
        }
        for key in ["defines", "references"] {
            if let Some(value) = fragment.get(key) {
                let valid = value
                    .as_array()
                    .map(|items| items.iter().all(|i| i.is_string()))
                    .unwrap_or(false);
                if !valid {
                    errors.push(
                        ValidationError::new(key, "typeDefsSyntax", "must be a list of type names")
                            .with_actual(value.clone()),
                    );
                }
            }
        }
        errors
    }

    async fn compile_schemata(
        &self,
        cache: &RouteCache,
        integrations: &[Arc<Integration>],
        _branch: &str,
    ) -> Result<Vec<CompiledRoute>, Vec<ValidationError>> {
        if let Some(gated) = &self.gated_service {
            if integrations.iter().any(|i| &i.service().id == gated) {
                self.gate.notified().await;
            }
        }

        let mut defined = HashSet::new();
        let mut errors = Vec::new();
        for integration in integrations {
            let fragment = &integration.service().schema.protocol[&ProtocolKey::GraphQl];
            for name in names(fragment, "defines") {
                if !defined.insert(name.clone()) {
                    errors.push(ValidationError::new(
                        "defines",
                        "typeDefsConflict",
                        format!("{} is defined twice ({})", name, integration.service().id),
                    ));
                }
            }
        }
        for integration in integrations {
            let fragment = &integration.service().schema.protocol[&ProtocolKey::GraphQl];
            for name in names(fragment, "references") {
                if !defined.contains(&name) {
                    errors.push(ValidationError::new(
                        "references",
                        "typeReferenceUnknown",
                        format!("Unknown type \"{}\" ({})", name, integration.service().id),
                    ));
                }
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let hash = Checksum::combine(integrations.iter().map(|i| i.schema_hash()));
        if let Some(route) = cache.get(&hash) {
            return Ok(vec![CompiledRoute { hash, route }]);
        }
        let route = Route::new(ProtocolKey::GraphQl, Transport::Http, "/graphql")
            .with_payload(json!({ "types": defined.len() }));
        Ok(vec![CompiledRoute::new(hash, route)])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Updated { branch: String, version: u64 },
    Removed { branch: String },
}

/// Listener recording every notification it receives
#[derive(Default)]
pub struct RecordingListener {
    pub notices: Mutex<Vec<Notice>>,
}

impl RecordingListener {
    pub fn updated_count(&self, branch: &str) -> usize {
        self.notices
            .lock()
            .iter()
            .filter(|n| matches!(n, Notice::Updated { branch: b, .. } if b == branch))
            .count()
    }

    pub fn removed_count(&self, branch: &str) -> usize {
        self.notices
            .lock()
            .iter()
            .filter(|n| matches!(n, Notice::Removed { branch: b } if b == branch))
            .count()
    }
}

#[async_trait]
impl RegistryListener for RecordingListener {
    async fn updated(&self, branch: Arc<Branch>) {
        let version = branch.latest_version().number();
        self.notices.lock().push(Notice::Updated {
            branch: branch.name().to_string(),
            version,
        });
    }

    async fn removed(&self, branch: Arc<Branch>) {
        self.notices.lock().push(Notice::Removed {
            branch: branch.name().to_string(),
        });
    }
}

pub fn graphql_service(id: &str, branch: &str, defines: &[&str], references: &[&str]) -> Service {
    Service::new(
        id,
        branch,
        ServiceSchema::new().with_protocol(
            ProtocolKey::GraphQl,
            json!({ "defines": defines, "references": references }),
        ),
    )
}

pub struct Harness {
    pub registry: SchemaRegistry,
    pub discovery: Arc<LocalDiscovery>,
    pub listener: Arc<RecordingListener>,
}

impl Harness {
    pub async fn start(config: GatewayConfig) -> Self {
        Self::start_with(config, TypeRefPlugin::default()).await
    }

    pub async fn start_with(config: GatewayConfig, plugin: TypeRefPlugin) -> Self {
        let discovery = Arc::new(LocalDiscovery::new("local"));
        let listener = Arc::new(RecordingListener::default());
        let registry = SchemaRegistry::new(config, ProtocolPlugins::new().with(Arc::new(plugin)))
            .with_discovery(discovery.clone());
        registry.start(listener.clone()).await.expect("registry starts");
        Self {
            registry,
            discovery,
            listener,
        }
    }

    pub fn branch(&self, name: &str) -> Arc<Branch> {
        self.registry.get_branch(name).expect("branch exists")
    }

    pub fn service_ids(&self, name: &str) -> Vec<String> {
        self.branch(name).services().iter().map(|s| s.id.clone()).collect()
    }

    /// Enqueue a connect directly, bypassing the discovery channel
    pub fn connect(&self, service: Service) {
        self.registry
            .dispatch(DiscoveryEvent::Connected(service))
            .expect("event is routed");
    }

    pub fn disconnect(&self, service: Service) {
        self.registry
            .dispatch(DiscoveryEvent::Disconnected {
                service,
                origin: "remote".to_string(),
            })
            .expect("event is routed");
    }

    /// Wait until the branch exists and has drained its inbox.
    ///
    /// Only meaningful after `connect`/`disconnect`, which enqueue synchronously.
    pub async fn settle(&self, name: &str) {
        for _ in 0..400 {
            if let Some(branch) = self.registry.get_branch(name) {
                if branch.is_idle() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("branch {} did not settle", name);
    }

    /// Poll until `condition` holds
    pub async fn wait_until(&self, condition: impl Fn(&SchemaRegistry) -> bool) {
        for _ in 0..400 {
            if condition(&self.registry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition was not met in time");
    }

    pub async fn stop(self) {
        self.registry.stop().await.expect("registry stops");
    }
}
