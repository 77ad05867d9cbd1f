//! Error types for the schema registry

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Schema registry errors
///
/// Schema problems of a single service are never reported through this type:
/// they travel as [`ValidationError`] values attached to the failing integration.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Discovery source {source_name} failed: {message}")]
    Discovery { source_name: String, message: String },

    #[error("Protocol plugin {protocol} failed: {message}")]
    Plugin { protocol: String, message: String },

    #[error("Schema registry has not been started")]
    NotStarted,

    #[error("Schema registry is already running")]
    AlreadyStarted,

    #[error("Branch {0} has been stopped")]
    BranchStopped(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn discovery(source_name: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Discovery {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }
}

/// A problem found while validating or compiling a schema fragment.
///
/// Recoverable: it is attached to the failing integration and reported,
/// and the branch keeps serving its latest version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Path of the offending field inside the fragment (e.g. `typeDefs`, `protocol.REST`)
    pub field: String,
    /// Machine readable error kind (e.g. `typeDefsSyntax`, `protocolUnsupported`)
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Value>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: kind.into(),
            message: message.into(),
            actual: None,
            expected: None,
        }
    }

    pub fn with_actual(mut self, actual: serde_json::Value) -> Self {
        self.actual = Some(actual);
        self
    }

    pub fn with_expected(mut self, expected: serde_json::Value) -> Self {
        self.expected = Some(expected);
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_wire_format() {
        let err = ValidationError::new("typeDefs", "typeDefsSyntax", "unexpected token")
            .with_actual(serde_json::json!("type Foo {"));
        let value = serde_json::to_value(&err).unwrap();

        assert_eq!(value["type"], "typeDefsSyntax");
        assert_eq!(value["actual"], "type Foo {");
        assert!(value.get("expected").is_none());
        assert_eq!(err.to_string(), "typeDefs: unexpected token (typeDefsSyntax)");
    }
}
