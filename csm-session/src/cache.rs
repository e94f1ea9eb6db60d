//! # Persistent Connection Cache
//!
//! Purpose: Keep connection sessions alive across host requests, keyed by a
//! connection fingerprint, with reference counting, admission control and
//! idle eviction.
//!
//! ## Design Principles
//! 1. **One Session Per Fingerprint**: A fingerprint maps to at most one live
//!    session; a hit hands out another lease on the same session.
//! 2. **Deferred Destruction**: An expired entry is only destroyed once its
//!    reference count is zero; referenced entries are logged and kept.
//! 3. **Shared Registry**: The registry is type-erased so other resource kinds
//!    can live beside connections; foreign entries are never evicted here.
//! 4. **Host Thread Only**: All mutation takes `&mut self`; only the per-entry
//!    reference counts are shared with leases.
//!
//! ## Lifecycle
//!
//! ```text
//! acquire ──hit──> refcount+1, expiry = now + idle_timeout
//!    │
//!    └─miss─> admit (reclaim idle+expired, earliest expiry first)
//!               └─> connect ──ok──> register (refcount 1)
//!                          └─err──> nothing registered
//!
//! evict_expired(now): expired && refcount == 0 -> stop + remove
//!                     expired && refcount  > 0 -> deferred
//! ```

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::RandomState;
use hashbrown::HashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use csm_cluster::{ClusterCoreFactory, ConnectionTarget};
use csm_common::{CommonErrc, CoreErrorInfo, CoreResult};

use crate::bridge::SyncBridge;
use crate::config::{AdmissionPolicy, CacheConfig};
use crate::session::ConnectionSession;

/// Opaque cache key of a reusable connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Fingerprint(value.into())
    }

    /// Hex SHA-256 of the connection string, username and password, each
    /// prefixed with its little-endian `u64` byte length.
    pub fn derive(target: &ConnectionTarget) -> Self {
        let mut hasher = Sha256::new();
        for field in [
            &target.connection_string,
            &target.credentials.username,
            &target.credentials.password,
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, for thread names.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(index, _)| index)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference count of one registry entry, shared with its leases.
#[derive(Debug, Clone, Default)]
pub struct ResourceHandle {
    count: Arc<AtomicUsize>,
}

impl ResourceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the count and returns the new value.
    pub fn acquire(&self) -> usize {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the count (never below zero) and returns the new value.
    pub fn release(&self) -> usize {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn refcount(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// A registered resource and its reference count.
pub struct RegistryEntry {
    pub resource: Arc<dyn Any + Send + Sync>,
    pub handle: ResourceHandle,
}

/// Process-wide fingerprint-keyed registry of persistent resources.
#[derive(Default)]
pub struct PersistentRegistry {
    entries: HashMap<Fingerprint, RegistryEntry, RandomState>,
}

impl PersistentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fingerprint: Fingerprint, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.entries.insert(fingerprint, entry)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&RegistryEntry> {
        self.entries.get(fingerprint)
    }

    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<RegistryEntry> {
        self.entries.remove(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fingerprint, &RegistryEntry)> {
        self.entries.iter()
    }

    fn drain(&mut self) -> impl Iterator<Item = (Fingerprint, RegistryEntry)> + '_ {
        self.entries.drain()
    }
}

/// A counted reference to a cached session.
///
/// Cloning acquires another reference; dropping releases one.
pub struct ConnectionLease {
    session: Arc<ConnectionSession>,
    handle: ResourceHandle,
    cache_hit: bool,
}

impl ConnectionLease {
    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }

    /// True when the lease was served from an existing entry.
    pub fn is_cache_hit(&self) -> bool {
        self.cache_hit
    }

    pub fn refcount(&self) -> usize {
        self.handle.refcount()
    }
}

impl Deref for ConnectionLease {
    type Target = ConnectionSession;

    fn deref(&self) -> &ConnectionSession {
        &self.session
    }
}

impl Clone for ConnectionLease {
    fn clone(&self) -> Self {
        self.handle.acquire();
        ConnectionLease {
            session: Arc::clone(&self.session),
            handle: self.handle.clone(),
            cache_hit: true,
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let remaining = self.handle.release();
        debug!(fingerprint = %self.session.fingerprint(), refcount = remaining, "lease released");
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("fingerprint", self.session.fingerprint())
            .field("refcount", &self.handle.refcount())
            .field("cache_hit", &self.cache_hit)
            .finish()
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Expired, unreferenced entries that were destroyed.
    pub evicted: Vec<Fingerprint>,
    /// Expired entries kept because they are still referenced.
    pub deferred: Vec<Fingerprint>,
}

pub struct PersistentConnectionCache {
    config: CacheConfig,
    factory: Arc<dyn ClusterCoreFactory>,
    bridge: SyncBridge,
    registry: PersistentRegistry,
}

impl PersistentConnectionCache {
    pub fn new(config: CacheConfig, factory: Arc<dyn ClusterCoreFactory>, bridge: SyncBridge) -> Self {
        PersistentConnectionCache {
            config,
            factory,
            bridge,
            registry: PersistentRegistry::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn acquire(
        &mut self,
        fingerprint: Fingerprint,
        target: &ConnectionTarget,
    ) -> CoreResult<ConnectionLease> {
        self.acquire_at(fingerprint, target, Instant::now())
    }

    /// Looks up or creates the session for `fingerprint` as of `now`.
    ///
    /// **Logic**:
    /// 1. Hit: bump the refcount, extend the expiry, hand out a lease.
    /// 2. Foreign entry under the key: discard it and continue as a miss.
    /// 3. Miss: make room (see `admit`), connect, register with refcount 1.
    pub fn acquire_at(
        &mut self,
        fingerprint: Fingerprint,
        target: &ConnectionTarget,
        now: Instant,
    ) -> CoreResult<ConnectionLease> {
        if let Some(entry) = self.registry.get(&fingerprint) {
            match Arc::clone(&entry.resource).downcast::<ConnectionSession>() {
                Ok(session) => {
                    let refcount = entry.handle.acquire();
                    session.set_expiry(self.expiry_from(now));
                    debug!(fingerprint = %fingerprint, refcount, "persistent connection hit");
                    return Ok(ConnectionLease {
                        session,
                        handle: entry.handle.clone(),
                        cache_hit: true,
                    });
                }
                Err(_) => {
                    warn!(fingerprint = %fingerprint, "discarding foreign registry entry");
                    self.registry.remove(&fingerprint);
                }
            }
        }

        self.admit(now)?;
        let session = ConnectionSession::connect(
            fingerprint.clone(),
            target.clone(),
            self.factory.as_ref(),
            self.bridge.clone(),
            self.config.session,
        )?;
        session.set_expiry(self.expiry_from(now));
        let handle = ResourceHandle::new();
        handle.acquire();
        let resource: Arc<dyn Any + Send + Sync> = session.clone();
        self.registry.insert(
            fingerprint.clone(),
            RegistryEntry {
                resource,
                handle: handle.clone(),
            },
        );
        info!(fingerprint = %fingerprint, live = self.live_connections(), "persistent connection created");
        Ok(ConnectionLease {
            session,
            handle,
            cache_hit: false,
        })
    }

    fn expiry_from(&self, now: Instant) -> Instant {
        now + self.config.idle_timeout
    }

    /// Makes room for one more connection when a limit is configured.
    fn admit(&mut self, now: Instant) -> CoreResult<()> {
        let Some(max) = self.config.max_connections else {
            return Ok(());
        };
        while self.live_connections() >= max {
            let Some(victim) = self.reclaimable(now) else {
                return match self.config.admission {
                    AdmissionPolicy::Soft => {
                        warn!(
                            max_connections = max,
                            live = self.live_connections(),
                            "persistent connection limit reached; creating anyway"
                        );
                        Ok(())
                    }
                    AdmissionPolicy::Strict => Err(CoreErrorInfo::new(
                        CommonErrc::QuotaLimited,
                        format!("persistent connection limit reached (max_connections={})", max),
                    )),
                };
            };
            info!(fingerprint = %victim, "reclaiming idle connection for admission");
            self.destroy(&victim);
        }
        Ok(())
    }

    /// Unreferenced, expired connection with the earliest expiry.
    fn reclaimable(&self, now: Instant) -> Option<Fingerprint> {
        self.connections()
            .filter(|(_, handle, session)| handle.refcount() == 0 && session.is_expired(now))
            .min_by_key(|(_, _, session)| session.expiry())
            .map(|(fingerprint, _, _)| fingerprint.clone())
    }

    fn connections(
        &self,
    ) -> impl Iterator<Item = (&Fingerprint, &ResourceHandle, &ConnectionSession)> + '_ {
        self.registry.iter().filter_map(|(fingerprint, entry)| {
            entry
                .resource
                .downcast_ref::<ConnectionSession>()
                .map(|session| (fingerprint, &entry.handle, session))
        })
    }

    fn destroy(&mut self, fingerprint: &Fingerprint) {
        if let Some(entry) = self.registry.remove(fingerprint) {
            if let Ok(session) = entry.resource.downcast::<ConnectionSession>() {
                session.stop();
            }
        }
    }

    /// Stops and unregisters the connection under `fingerprint` whatever its
    /// reference count. Outstanding leases keep a stopped session.
    pub fn discard(&mut self, fingerprint: &Fingerprint) -> bool {
        let Some(refcount) = self
            .connections()
            .find(|(key, _, _)| *key == fingerprint)
            .map(|(_, handle, _)| handle.refcount())
        else {
            return false;
        };
        warn!(fingerprint = %fingerprint, refcount, "discarding persistent connection");
        self.destroy(fingerprint);
        true
    }

    /// Destroys expired, unreferenced connections; referenced ones are kept.
    pub fn evict_expired(&mut self, now: Instant) -> EvictionReport {
        let mut report = EvictionReport::default();
        for (fingerprint, handle, session) in self.connections() {
            if !session.is_expired(now) {
                continue;
            }
            let refcount = handle.refcount();
            if refcount == 0 {
                report.evicted.push(fingerprint.clone());
            } else {
                debug!(
                    fingerprint = %fingerprint,
                    refcount,
                    "expired persistent connection still referenced; deferring"
                );
                report.deferred.push(fingerprint.clone());
            }
        }
        report.evicted.sort();
        report.deferred.sort();
        for fingerprint in &report.evicted {
            info!(fingerprint = %fingerprint, "evicting idle persistent connection");
            self.destroy(fingerprint);
        }
        report
    }

    /// Number of registered connection sessions.
    pub fn live_connections(&self) -> usize {
        self.connections().count()
    }

    pub fn sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.registry
            .iter()
            .filter_map(|(_, entry)| Arc::clone(&entry.resource).downcast::<ConnectionSession>().ok())
            .collect()
    }

    pub fn session(&self, fingerprint: &Fingerprint) -> Option<Arc<ConnectionSession>> {
        self.registry
            .get(fingerprint)
            .and_then(|entry| Arc::clone(&entry.resource).downcast::<ConnectionSession>().ok())
    }

    pub fn refcount(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.registry
            .get(fingerprint)
            .map(|entry| entry.handle.refcount())
    }

    pub fn registry(&self) -> &PersistentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PersistentRegistry {
        &mut self.registry
    }

    /// Stops every cached session regardless of references and empties the
    /// registry.
    pub fn shutdown(&mut self) {
        let drained: Vec<_> = self.registry.drain().collect();
        for (fingerprint, entry) in drained {
            if let Ok(session) = entry.resource.downcast::<ConnectionSession>() {
                debug!(fingerprint = %fingerprint, refcount = entry.handle.refcount(), "shutting down session");
                session.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use csm_cluster::{Credentials, LoopbackCluster};
    use csm_common::ErrorCode;

    use crate::metrics::BridgeMetrics;

    fn target() -> ConnectionTarget {
        ConnectionTarget::new(
            "couchbase://127.0.0.1",
            Credentials {
                username: "Administrator".into(),
                password: "password".into(),
            },
        )
    }

    fn cache(cluster: &LoopbackCluster, config: CacheConfig) -> PersistentConnectionCache {
        PersistentConnectionCache::new(
            config,
            Arc::new(cluster.clone()),
            SyncBridge::new(Arc::new(BridgeMetrics::new())),
        )
    }

    #[test]
    fn fingerprint_hides_credentials() {
        let fingerprint = Fingerprint::derive(&target());
        assert_eq!(fingerprint.as_str().len(), 64);
        assert!(!fingerprint.as_str().contains("password"));
        assert_eq!(fingerprint, Fingerprint::derive(&target()));
        assert_eq!(fingerprint.short().len(), 12);
        assert_eq!(Fingerprint::new("A").short(), "A");
    }

    #[test]
    fn fingerprint_fields_cannot_bleed_into_each_other() {
        let split = |username: &str, password: &str| {
            ConnectionTarget::new(
                "couchbase://127.0.0.1",
                Credentials {
                    username: username.into(),
                    password: password.into(),
                },
            )
        };
        assert_ne!(
            Fingerprint::derive(&split("u|x", "p")),
            Fingerprint::derive(&split("u", "x|p"))
        );
        assert_ne!(
            Fingerprint::derive(&split("ux", "")),
            Fingerprint::derive(&split("u", "x"))
        );
    }

    #[test]
    fn rejected_credentials_never_share_a_session() {
        let cluster = LoopbackCluster::new();
        cluster.set_credentials("u", "x|p");
        let mut cache = cache(&cluster, CacheConfig::default());
        let good = ConnectionTarget::new(
            "couchbase://127.0.0.1",
            Credentials {
                username: "u".into(),
                password: "x|p".into(),
            },
        );
        let bad = ConnectionTarget::new(
            "couchbase://127.0.0.1",
            Credentials {
                username: "u|x".into(),
                password: "p".into(),
            },
        );

        let _lease = cache.acquire(Fingerprint::derive(&good), &good).unwrap();
        let err = cache.acquire(Fingerprint::derive(&bad), &bad).unwrap_err();
        assert_eq!(err.code, ErrorCode::Common(CommonErrc::AuthenticationFailure));
        assert_eq!(cache.live_connections(), 1);
    }

    #[test]
    fn handle_release_never_underflows() {
        let handle = ResourceHandle::new();
        assert_eq!(handle.acquire(), 1);
        assert_eq!(handle.release(), 0);
        assert_eq!(handle.release(), 0);
        assert_eq!(handle.refcount(), 0);
    }

    #[test]
    fn failed_connect_registers_nothing() {
        let cluster = LoopbackCluster::new();
        cluster.set_credentials("Administrator", "rotated");
        let mut cache = cache(&cluster, CacheConfig::default());

        let err = cache.acquire(Fingerprint::new("A"), &target()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Common(CommonErrc::AuthenticationFailure));
        assert_eq!(cache.live_connections(), 0);
    }

    #[test]
    fn foreign_entry_is_replaced_by_a_session() {
        let cluster = LoopbackCluster::new();
        let mut cache = cache(&cluster, CacheConfig::default());
        cache.registry_mut().insert(
            Fingerprint::new("A"),
            RegistryEntry {
                resource: Arc::new("not a session".to_string()),
                handle: ResourceHandle::new(),
            },
        );

        let lease = cache.acquire(Fingerprint::new("A"), &target()).unwrap();
        assert!(!lease.is_cache_hit());
        assert_eq!(cache.live_connections(), 1);
    }

    #[test]
    fn eviction_defers_referenced_entries() {
        let cluster = LoopbackCluster::new();
        let mut cache = cache(&cluster, CacheConfig::default());
        let now = Instant::now();
        let held = cache.acquire_at(Fingerprint::new("A"), &target(), now).unwrap();
        let released = cache.acquire_at(Fingerprint::new("B"), &target(), now).unwrap();
        drop(released);

        let report = cache.evict_expired(now + Duration::from_millis(1));
        assert_eq!(report.evicted, vec![Fingerprint::new("B")]);
        assert_eq!(report.deferred, vec![Fingerprint::new("A")]);
        assert!(held.is_running());

        drop(held);
        let report = cache.evict_expired(now + Duration::from_millis(2));
        assert_eq!(report.evicted, vec![Fingerprint::new("A")]);
        assert_eq!(cache.live_connections(), 0);
        assert_eq!(cluster.open_cores(), 0);
    }

    #[test]
    fn strict_admission_rejects_when_nothing_is_reclaimable() {
        let cluster = LoopbackCluster::new();
        let config = CacheConfig {
            max_connections: Some(1),
            admission: AdmissionPolicy::Strict,
            ..CacheConfig::default()
        };
        let mut cache = cache(&cluster, config);
        let _held = cache.acquire(Fingerprint::new("A"), &target()).unwrap();

        let err = cache.acquire(Fingerprint::new("B"), &target()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Common(CommonErrc::QuotaLimited));
        assert_eq!(err.message, "persistent connection limit reached (max_connections=1)");
    }

    #[test]
    fn zero_limit_strict_admission_rejects_every_miss() {
        let cluster = LoopbackCluster::new();
        let config = CacheConfig {
            max_connections: Some(0),
            admission: AdmissionPolicy::Strict,
            ..CacheConfig::default()
        };
        let mut cache = cache(&cluster, config);
        let now = Instant::now();

        let err = cache.acquire_at(Fingerprint::new("A"), &target(), now).unwrap_err();
        assert_eq!(err.code, ErrorCode::Common(CommonErrc::QuotaLimited));
        assert_eq!(err.message, "persistent connection limit reached (max_connections=0)");
        assert_eq!(cache.live_connections(), 0);
    }

    #[test]
    fn zero_limit_soft_admission_reclaims_then_creates() {
        let cluster = LoopbackCluster::new();
        let config = CacheConfig {
            max_connections: Some(0),
            ..CacheConfig::default()
        };
        let mut cache = cache(&cluster, config);
        let now = Instant::now();

        drop(cache.acquire_at(Fingerprint::new("A"), &target(), now).unwrap());
        assert_eq!(cache.live_connections(), 1);

        let _b = cache
            .acquire_at(Fingerprint::new("B"), &target(), now + Duration::from_millis(1))
            .unwrap();
        assert!(cache.session(&Fingerprint::new("A")).is_none());
        assert_eq!(cache.live_connections(), 1);
    }

    #[test]
    fn soft_admission_overshoots_with_a_warning() {
        let cluster = LoopbackCluster::new();
        let config = CacheConfig {
            max_connections: Some(1),
            ..CacheConfig::default()
        };
        let mut cache = cache(&cluster, config);
        let _a = cache.acquire(Fingerprint::new("A"), &target()).unwrap();
        let _b = cache.acquire(Fingerprint::new("B"), &target()).unwrap();
        assert_eq!(cache.live_connections(), 2);
    }

    #[test]
    fn reclaim_prefers_earliest_expiry() {
        let cluster = LoopbackCluster::new();
        let config = CacheConfig {
            max_connections: Some(2),
            ..CacheConfig::default()
        };
        let mut cache = cache(&cluster, config);
        let start = Instant::now();
        drop(cache.acquire_at(Fingerprint::new("late"), &target(), start + Duration::from_millis(5)));
        drop(cache.acquire_at(Fingerprint::new("early"), &target(), start));

        let _c = cache
            .acquire_at(Fingerprint::new("C"), &target(), start + Duration::from_millis(10))
            .unwrap();
        assert!(cache.session(&Fingerprint::new("early")).is_none());
        assert!(cache.session(&Fingerprint::new("late")).is_some());
    }

    #[test]
    fn idle_timeout_extends_expiry_on_hit() {
        let cluster = LoopbackCluster::new();
        let config = CacheConfig {
            idle_timeout: Duration::from_secs(60),
            ..CacheConfig::default()
        };
        let mut cache = cache(&cluster, config);
        let now = Instant::now();
        drop(cache.acquire_at(Fingerprint::new("A"), &target(), now).unwrap());

        let later = now + Duration::from_secs(30);
        let lease = cache.acquire_at(Fingerprint::new("A"), &target(), later).unwrap();
        assert!(lease.is_cache_hit());
        assert_eq!(lease.expiry(), later + Duration::from_secs(60));
        drop(lease);
        assert!(cache.evict_expired(now + Duration::from_secs(61)).evicted.is_empty());
    }

    #[test]
    fn discard_drops_a_referenced_session() {
        let cluster = LoopbackCluster::new();
        let mut cache = cache(&cluster, CacheConfig::default());
        let lease = cache.acquire(Fingerprint::new("A"), &target()).unwrap();

        assert!(cache.discard(&Fingerprint::new("A")));
        assert!(!cache.discard(&Fingerprint::new("A")));
        assert!(!lease.is_running());
        assert_eq!(cache.live_connections(), 0);

        let fresh = cache.acquire(Fingerprint::new("A"), &target()).unwrap();
        assert!(!fresh.is_cache_hit());
        assert!(fresh.is_running());
    }

    #[test]
    fn shutdown_stops_referenced_sessions() {
        let cluster = LoopbackCluster::new();
        let mut cache = cache(&cluster, CacheConfig::default());
        let lease = cache.acquire(Fingerprint::new("A"), &target()).unwrap();
        cache.shutdown();
        cache.shutdown();
        assert!(!lease.is_running());
        assert!(cache.registry().is_empty());
    }
}
