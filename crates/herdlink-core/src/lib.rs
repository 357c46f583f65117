//! Herdlink Core - offline-tolerant data-access gateway for a JSON REST API.
//!
//! This crate sits between UI code and the remote API. It gates requests on
//! session bootstrap, serializes credential refresh, shares concurrent
//! identical reads, keeps a two-tier response cache with offline fallback,
//! queues writes made while offline, and normalizes response envelopes.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod normalize;
pub mod offline;
pub mod resource;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types at crate root
pub use auth::{AuthGateState, Credential};
pub use config::{DeviceClass, GatewayConfig};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayBuilder};
pub use http::Method;
pub use normalize::{EnvelopeShape, PaginatedResult};
pub use offline::{OfflineQueueItem, ReplayReport};
pub use resource::{ChangeSet, ResourceClient, ResourceMetadata, WriteOutcome};
pub use sync::{ConditionalSyncClient, ResourceSyncState, SyncStrategy};
