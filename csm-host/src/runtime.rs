//! # Host Runtime
//!
//! Purpose: The per-process state an embedding host keeps: the cache
//! service plus a table of request-scoped resource handles.
//!
//! ## Design Principles
//! 1. **Handles, Not Pointers**: The host only ever sees integer handles;
//!    the table owns the leases and sessions behind them.
//! 2. **Request Scope**: `end_request` drops every handle before the cache
//!    runs its expiry sweep, so released connections become reclaimable.
//! 3. **Exceptions at the Edge**: `call` is the only place a
//!    `CoreErrorInfo` is rendered into a `HostException`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use csm_cluster::ClusterCoreFactory;
use csm_common::{CoreErrorInfo, CoreResult, ForkEvent, HostException};
use csm_session::{
    CacheService, ConnectionLease, EvictionReport, ForkReport, TransactionAttempt,
    TransactionSession,
};

use crate::api;
use crate::settings::HostSettings;

pub type Handle = u64;

/// A host-visible resource.
pub enum Resource {
    Connection(ConnectionLease),
    Transactions(Arc<TransactionSession>),
    Attempt(TransactionAttempt),
}

impl Resource {
    fn kind(&self) -> &'static str {
        match self {
            Resource::Connection(_) => "connection",
            Resource::Transactions(_) => "transactions",
            Resource::Attempt(_) => "transaction attempt",
        }
    }
}

/// Handle-indexed resources owned on behalf of the host.
#[derive(Default)]
pub struct ResourceTable {
    next: Handle,
    entries: BTreeMap<Handle, Resource>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: Resource) -> Handle {
        self.next += 1;
        self.entries.insert(self.next, resource);
        self.next
    }

    pub fn get(&self, handle: Handle) -> Option<&Resource> {
        self.entries.get(&handle)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<Resource> {
        self.entries.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops attempts first, then transaction sessions, then connections.
    pub fn clear(&mut self) {
        self.entries
            .retain(|_, resource| !matches!(resource, Resource::Attempt(_)));
        self.entries
            .retain(|_, resource| !matches!(resource, Resource::Transactions(_)));
        self.entries.clear();
    }

    pub fn connection(&self, handle: Handle) -> CoreResult<&ConnectionLease> {
        match self.get(handle) {
            Some(Resource::Connection(lease)) => Ok(lease),
            other => Err(wrong_handle("connection", handle, other)),
        }
    }

    pub fn transactions(&self, handle: Handle) -> CoreResult<&Arc<TransactionSession>> {
        match self.get(handle) {
            Some(Resource::Transactions(session)) => Ok(session),
            other => Err(wrong_handle("transactions", handle, other)),
        }
    }

    pub fn attempt(&self, handle: Handle) -> CoreResult<&TransactionAttempt> {
        match self.get(handle) {
            Some(Resource::Attempt(attempt)) => Ok(attempt),
            other => Err(wrong_handle("transaction attempt", handle, other)),
        }
    }
}

#[track_caller]
fn wrong_handle(expected: &str, handle: Handle, found: Option<&Resource>) -> CoreErrorInfo {
    let message = match found {
        Some(resource) => format!(
            "expected {} for handle {}, found {}",
            expected,
            handle,
            resource.kind()
        ),
        None => format!("unknown {} handle {}", expected, handle),
    };
    CoreErrorInfo::invalid_argument(message)
}

pub struct HostRuntime {
    service: CacheService,
    resources: ResourceTable,
    settings: HostSettings,
}

impl HostRuntime {
    /// Module startup.
    pub fn startup(settings: HostSettings, factory: Arc<dyn ClusterCoreFactory>) -> CoreResult<Self> {
        let service = CacheService::startup(settings.cache_config(), factory)?;
        info!(
            max_persistent = ?settings.max_persistent,
            persistent_timeout = ?settings.persistent_timeout,
            "host runtime started"
        );
        Ok(HostRuntime {
            service,
            resources: ResourceTable::new(),
            settings,
        })
    }

    /// Calls a host function by name.
    ///
    /// **Input**: function name and positional host-native arguments.
    /// **Output**: a host-native result, or the rendered exception.
    pub fn call(&mut self, function: &str, args: &[Value]) -> Result<Value, HostException> {
        api::dispatch(self, function, args).map_err(|err| {
            debug!(function, code = err.code.name(), "host call failed");
            HostException::from(&err)
        })
    }

    /// Drops a handle; `false` if it was unknown.
    pub fn release(&mut self, handle: Handle) -> bool {
        self.resources.remove(handle).is_some()
    }

    /// Request shutdown: drops every handle and sweeps expired connections.
    pub fn end_request(&mut self) -> EvictionReport {
        self.resources.clear();
        self.service.end_of_request()
    }

    /// Forwards a host fork hook (`prepare`, `parent` or `child`).
    pub fn fork(&mut self, event: &str) -> CoreResult<ForkReport> {
        let event: ForkEvent = event.parse()?;
        Ok(self.service.notify_fork(event))
    }

    /// Module shutdown.
    pub fn shutdown(&mut self) {
        self.resources.clear();
        self.service.shutdown();
    }

    pub fn service(&self) -> &CacheService {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut CacheService {
        &mut self.service
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceTable {
        &mut self.resources
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
