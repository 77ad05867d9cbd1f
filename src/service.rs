//! Service types advertised by the discovery layer

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::checksum::Checksum;

/// Protocol a service schema fragment is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolKey {
    /// GraphQL type definitions and resolvers
    #[serde(rename = "GraphQL")]
    GraphQl,
    /// REST endpoint declarations
    #[serde(rename = "REST")]
    Rest,
}

impl ProtocolKey {
    /// Wire name of this protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKey::GraphQl => "GraphQL",
            ProtocolKey::Rest => "REST",
        }
    }
}

impl fmt::Display for ProtocolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The API schema a service declares for the gateway
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Per-protocol schema fragments, opaque to the registry
    #[serde(default)]
    pub protocol: BTreeMap<ProtocolKey, serde_json::Value>,
    /// Access policy fragment, opaque to the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<serde_json::Value>,
}

impl ServiceSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment for one protocol
    pub fn with_protocol(mut self, key: ProtocolKey, fragment: serde_json::Value) -> Self {
        self.protocol.insert(key, fragment);
        self
    }

    pub fn with_policy(mut self, policy: serde_json::Value) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Content hash over every protocol fragment and the policy fragment
    pub fn checksum(&self) -> Checksum {
        Checksum::from_serialize(self)
    }
}

/// A backend service as announced by a discovery source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Identifier, unique within a branch
    pub id: String,
    /// Branch the service wants to be composed into
    pub branch: String,
    pub schema: ServiceSchema,
}

impl Service {
    pub fn new(id: impl Into<String>, branch: impl Into<String>, schema: ServiceSchema) -> Self {
        Self {
            id: id.into(),
            branch: branch.into(),
            schema,
        }
    }

    /// Content hash of the declared schema
    pub fn hash(&self) -> Checksum {
        self.schema.checksum()
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.hash().short())
    }
}
