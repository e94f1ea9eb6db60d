// csm-session - Blocking session layer over an asynchronous cluster core
//
// Owns the persistent connection cache, the synchronous bridge every cluster
// call goes through, transaction sessions and fork coordination.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod fork;
pub mod metrics;
mod operations;
pub mod service;
pub mod session;
pub mod transactions;

// Re-export for convenience
pub use crate::bridge::{submit_with, AsyncOperation, Signal, SyncBridge};
pub use crate::cache::{
    ConnectionLease, EvictionReport, Fingerprint, PersistentConnectionCache, PersistentRegistry,
    RegistryEntry, ResourceHandle,
};
pub use crate::config::{AdmissionPolicy, CacheConfig, ConfigError, SessionSettings};
pub use crate::fork::{ForkAware, ForkCoordinator, ForkFailure, ForkReport, ForkTarget, ForkVisit};
pub use crate::metrics::{BridgeMetrics, LatencySnapshot, MetricsSnapshot};
pub use crate::service::CacheService;
pub use crate::session::ConnectionSession;
pub use crate::transactions::{TransactionAttempt, TransactionSession};
