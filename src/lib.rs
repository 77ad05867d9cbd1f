//! Gateway Schema Registry
//!
//! Composes the API schemas advertised by a changing set of backend services
//! into one versioned API surface per named branch.
//!
//! ## Features
//!
//! - **Order Independence**: Failed integrations are retried whenever the branch
//!   changes, so services converge regardless of the order they connect in
//! - **Failure Isolation**: A broken schema fails only its own integration; the
//!   branch keeps serving its latest version
//! - **Bounded History**: Each branch keeps its last `max_versions` versions
//! - **Checksum Skipping**: Reconnects with an unchanged schema hash do not recompose
//! - **Pluggable Protocols**: Validation and compilation are delegated to
//!   [`ProtocolPlugin`] implementations
//!
//! ## Architecture
//!
//! ```text
//! ServiceDiscovery ──events──▶ SchemaRegistry ──route by branch──▶ Branch inbox (FIFO)
//!                                                                   │
//!                                     ProtocolPlugins ◀──candidate──┤
//!                                                                   ▼
//!                      RegistryListener ◀──updated/removed──── Version chain
//! ```

pub mod branch;
pub mod checksum;
pub mod config;
pub mod discovery;
pub mod error;
pub mod integration;
pub mod plugin;
pub mod registry;
pub mod route;
pub mod service;
pub mod version;

pub use branch::{Branch, BranchEvent, BranchSummary, BranchUpdate};
pub use checksum::Checksum;
pub use config::{BranchConfig, GatewayConfig, RegistrySettings};
pub use discovery::{DiscoveryEvent, LocalDiscovery, ServiceDiscovery};
pub use error::{RegistryError, Result, ValidationError};
pub use integration::{Integration, IntegrationKind, IntegrationStatus, IntegrationSummary};
pub use plugin::{ProtocolPlugin, ProtocolPlugins};
pub use registry::{RegistryListener, SchemaRegistry};
pub use route::{CompiledRoute, Route, RouteCache, Transport};
pub use service::{ProtocolKey, Service, ServiceSchema};
pub use version::{Version, VersionSummary};
