//! Protocol plugins
//!
//! A protocol plugin validates the fragments services declare for its protocol
//! and compiles the fragments of a whole candidate set into routes. The
//! registry never looks inside a fragment itself; everything it knows about a
//! schema language comes through [`ProtocolPlugin`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{RegistryError, Result, ValidationError};
use crate::integration::Integration;
use crate::route::{CompiledRoute, RouteCache};
use crate::service::{ProtocolKey, ServiceSchema};

/// Capability interface every protocol implements
#[async_trait]
pub trait ProtocolPlugin: Send + Sync {
    /// Protocol this plugin is responsible for
    fn key(&self) -> ProtocolKey;

    /// Validate one service's fragment in isolation. Empty means valid.
    fn validate_schema(&self, fragment: &serde_json::Value) -> Vec<ValidationError>;

    /// Compile the fragments of every given integration into routes.
    ///
    /// Must be deterministic for the same integration set. Routes found in
    /// `cache` under the hash the plugin would produce may be returned as-is.
    async fn compile_schemata(
        &self,
        cache: &RouteCache,
        integrations: &[Arc<Integration>],
        branch: &str,
    ) -> std::result::Result<Vec<CompiledRoute>, Vec<ValidationError>>;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// The closed set of protocol plugins a registry composes with
#[derive(Clone, Default)]
pub struct ProtocolPlugins {
    plugins: BTreeMap<ProtocolKey, Arc<dyn ProtocolPlugin>>,
}

impl ProtocolPlugins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, replacing any plugin for the same protocol
    pub fn with(mut self, plugin: Arc<dyn ProtocolPlugin>) -> Self {
        self.plugins.insert(plugin.key(), plugin);
        self
    }

    pub fn get(&self, key: ProtocolKey) -> Option<&Arc<dyn ProtocolPlugin>> {
        self.plugins.get(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = ProtocolKey> + '_ {
        self.plugins.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Validate every fragment of a service schema against its plugin
    pub fn validate(&self, schema: &ServiceSchema) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (key, fragment) in &schema.protocol {
            match self.plugins.get(key) {
                Some(plugin) => {
                    for mut error in plugin.validate_schema(fragment) {
                        error.field = if error.field.is_empty() {
                            format!("protocol.{}", key)
                        } else {
                            format!("protocol.{}.{}", key, error.field)
                        };
                        errors.push(error);
                    }
                }
                None => errors.push(
                    ValidationError::new(
                        format!("protocol.{}", key),
                        "protocolUnsupported",
                        format!("{} protocol is not enabled in this gateway", key),
                    )
                    .with_expected(serde_json::json!(self.keys().map(|k| k.as_str()).collect::<Vec<_>>())),
                ),
            }
        }
        errors
    }

    /// Compile a candidate set with every plugin.
    ///
    /// Each plugin only sees the integrations that declare a fragment for its
    /// protocol. Errors of all plugins are collected before failing.
    pub async fn compile(
        &self,
        cache: &RouteCache,
        integrations: &[Arc<Integration>],
        branch: &str,
    ) -> std::result::Result<Vec<CompiledRoute>, Vec<ValidationError>> {
        let mut routes = Vec::new();
        let mut errors = Vec::new();

        for (key, plugin) in &self.plugins {
            let relevant: Vec<Arc<Integration>> = integrations
                .iter()
                .filter(|integration| integration.service().schema.protocol.contains_key(key))
                .cloned()
                .collect();

            match plugin.compile_schemata(cache, &relevant, branch).await {
                Ok(compiled) => {
                    debug!(branch, protocol = %key, routes = compiled.len(), "compiled protocol schemata");
                    routes.extend(compiled);
                }
                Err(plugin_errors) => errors.extend(plugin_errors),
            }
        }

        if errors.is_empty() {
            Ok(routes)
        } else {
            Err(errors)
        }
    }

    pub async fn start(&self) -> Result<()> {
        for (key, plugin) in &self.plugins {
            plugin.start().await.map_err(|e| RegistryError::Plugin {
                protocol: key.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        for (key, plugin) in &self.plugins {
            plugin.stop().await.map_err(|e| RegistryError::Plugin {
                protocol: key.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}
