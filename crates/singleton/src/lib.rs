//! Cluster-wide singleton services coordinated through entity ownership.
//!
//! Services are grouped by [`ServiceGroupIdentifier`]. Each group runs on exactly one node
//! at a time: the node that owns both the group's service entity and its cleanup entity. The
//! cleanup entity is only released once all of a group's services have stopped, so a new
//! owner never starts while the previous one is still shutting down.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod group;
mod provider;
mod registration;
mod service;
mod service_info;

pub use config::{CLEANUP_ENTITY_TYPE, ProviderConfig, SERVICE_ENTITY_TYPE};
pub use error::Error;
pub use group::{ActiveServiceGroup, CloseFuture, PlaceholderServiceGroup, ServiceGroup};
pub use provider::{ClusterSingletonServiceProvider, create_entity, service_identifier_from_entity};
pub use registration::ServiceRegistration;
pub use service::{BoxError, ClusterSingletonService, ServiceGroupIdentifier};
