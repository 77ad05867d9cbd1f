//! Integration records
//!
//! An [`Integration`] describes one attempt to add or remove one service's
//! schema within one composition attempt. Records are immutable: resolving an
//! attempt produces a new record through [`Integration::succeed`],
//! [`Integration::fail`] or [`Integration::skip`], and retrying a failed
//! attempt produces a fresh queued record through [`Integration::retry`].
//! Versions keep the resolved records in their history, so an earlier failure
//! stays on record while a later attempt for the same schema succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::checksum::Checksum;
use crate::error::ValidationError;
use crate::service::Service;
use crate::version::Version;

static NEXT_INTEGRATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Queued,
    Succeed,
    Failed,
    Skipped,
}

impl fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            IntegrationStatus::Queued => "queued",
            IntegrationStatus::Succeed => "succeed",
            IntegrationStatus::Failed => "failed",
            IntegrationStatus::Skipped => "skipped",
        };
        f.write_str(status)
    }
}

/// One attempt to add or remove one service's schema
#[derive(Debug, Clone)]
pub struct Integration {
    id: u64,
    kind: IntegrationKind,
    service: Arc<Service>,
    schema_hash: Checksum,
    status: IntegrationStatus,
    errors: Option<Vec<ValidationError>>,
    created_at: DateTime<Utc>,
}

impl Integration {
    /// Queue an attempt to add (or replace) a service's schema
    pub fn add(service: Arc<Service>) -> Self {
        Self::queued(IntegrationKind::Add, service)
    }

    /// Queue an attempt to remove a service's schema
    pub fn remove(service: Arc<Service>) -> Self {
        Self::queued(IntegrationKind::Remove, service)
    }

    fn queued(kind: IntegrationKind, service: Arc<Service>) -> Self {
        let schema_hash = service.hash();
        Self {
            id: NEXT_INTEGRATION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            service,
            schema_hash,
            status: IntegrationStatus::Queued,
            errors: None,
            created_at: Utc::now(),
        }
    }

    /// A fresh queued attempt carrying the same service and schema
    pub fn retry(&self) -> Self {
        Self {
            id: NEXT_INTEGRATION_ID.fetch_add(1, Ordering::Relaxed),
            kind: self.kind,
            service: self.service.clone(),
            schema_hash: self.schema_hash.clone(),
            status: IntegrationStatus::Queued,
            errors: None,
            created_at: Utc::now(),
        }
    }

    pub fn succeed(&self) -> Self {
        self.resolve(IntegrationStatus::Succeed, None)
    }

    pub fn fail(&self, errors: Vec<ValidationError>) -> Self {
        self.resolve(IntegrationStatus::Failed, Some(errors))
    }

    pub fn skip(&self) -> Self {
        self.resolve(IntegrationStatus::Skipped, None)
    }

    fn resolve(&self, status: IntegrationStatus, errors: Option<Vec<ValidationError>>) -> Self {
        debug_assert_eq!(self.status, IntegrationStatus::Queued, "integration {} resolved twice", self.id);
        Self {
            status,
            errors,
            ..self.clone()
        }
    }

    /// Identifier of this attempt; transitions keep it, retries get a new one
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> IntegrationKind {
        self.kind
    }

    pub fn status(&self) -> IntegrationStatus {
        self.status
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn schema_hash(&self) -> &Checksum {
        &self.schema_hash
    }

    /// Validation errors, only present on failed attempts
    pub fn errors(&self) -> Option<&[ValidationError]> {
        self.errors.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_resolved(&self) -> bool {
        self.status != IntegrationStatus::Queued
    }

    pub fn summary(&self) -> IntegrationSummary {
        IntegrationSummary {
            id: self.id,
            kind: self.kind,
            status: self.status,
            service: self.service.id.clone(),
            hash: self.schema_hash.clone(),
            errors: self.errors.clone().unwrap_or_default(),
        }
    }

    /// Report the outcome of this attempt with its branch and version context
    pub(crate) fn report(&self, version: &Version) {
        match self.status {
            IntegrationStatus::Succeed => {
                let from = version.parent_number().map(|n| format!("{}@v{}", version.branch(), n));
                let integrations: Vec<String> = version
                    .integrations()
                    .iter()
                    .map(|int| {
                        if int.id == self.id {
                            int.to_string()
                        } else {
                            int.service.to_string()
                        }
                    })
                    .collect();
                info!(
                    branch = %version.branch(),
                    from = from.as_deref().unwrap_or("-"),
                    to = %version,
                    integration = %self,
                    integrations = ?integrations,
                    routes = version.routes().len(),
                    "gateway has been updated successfully"
                );
            }
            IntegrationStatus::Skipped => {
                info!(
                    branch = %version.branch(),
                    version = %version,
                    integration = %self,
                    "gateway found no changes"
                );
            }
            IntegrationStatus::Failed => {
                let errors: Vec<String> = self
                    .errors
                    .iter()
                    .flatten()
                    .map(|e| e.to_string())
                    .collect();
                error!(
                    branch = %version.branch(),
                    version = %version,
                    integration = %self,
                    errors = ?errors,
                    "gateway has been failed to update"
                );
            }
            IntegrationStatus::Queued => {}
        }
    }
}

impl fmt::Display for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = match self.kind {
            IntegrationKind::Add => "+",
            IntegrationKind::Remove => "-",
        };
        write!(f, "({}) {} {}", sign, self.service, self.status)
    }
}

/// Serializable view of an integration for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSummary {
    pub id: u64,
    pub kind: IntegrationKind,
    pub status: IntegrationStatus,
    pub service: String,
    pub hash: Checksum,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ProtocolKey, ServiceSchema};
    use serde_json::json;

    fn service(id: &str) -> Arc<Service> {
        Arc::new(Service::new(
            id,
            "master",
            ServiceSchema::new().with_protocol(ProtocolKey::Rest, json!({"path": format!("/{}", id)})),
        ))
    }

    #[test]
    fn test_transitions_return_new_records() {
        let queued = Integration::add(service("users"));
        let failed = queued.fail(vec![ValidationError::new("path", "pathInvalid", "bad path")]);

        assert_eq!(queued.status(), IntegrationStatus::Queued);
        assert!(queued.errors().is_none());
        assert_eq!(failed.status(), IntegrationStatus::Failed);
        assert_eq!(failed.id(), queued.id());
        assert_eq!(failed.errors().unwrap().len(), 1);
    }

    #[test]
    fn test_retry_is_a_fresh_attempt() {
        let failed = Integration::add(service("users")).fail(vec![]);
        let retry = failed.retry();

        assert_ne!(retry.id(), failed.id());
        assert_eq!(retry.status(), IntegrationStatus::Queued);
        assert_eq!(retry.schema_hash(), failed.schema_hash());
        assert!(Arc::ptr_eq(retry.service(), failed.service()));
        assert_eq!(failed.status(), IntegrationStatus::Failed);
    }

    #[test]
    fn test_display_and_summary() {
        let svc = service("users");
        let removed = Integration::remove(svc.clone()).succeed();
        assert_eq!(removed.to_string(), format!("(-) users@{} succeed", svc.hash().short()));

        let summary = removed.summary();
        assert_eq!(summary.service, "users");
        assert_eq!(summary.kind, IntegrationKind::Remove);
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["status"], "succeed");
        assert!(value.get("errors").is_none());
    }
}
