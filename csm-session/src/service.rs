//! # Cache Service
//!
//! Purpose: The one explicitly constructed owner of the process-wide session
//! state: the persistent connection cache, the live transaction sessions,
//! the fork coordinator and the bridge metrics.
//!
//! ## Design Principles
//! 1. **Explicit Lifecycle**: `startup` and `shutdown` are called by the
//!    host's own startup and shutdown sequence; there are no globals.
//! 2. **Host Thread Only**: Every method takes `&mut self` and is called from
//!    the embedding runtime's single thread.
//! 3. **Weak Transactions**: Transaction sessions are tracked weakly, so the
//!    host decides their lifetime and the service only visits live ones.

use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::info;

use csm_cluster::{ClusterCoreFactory, ConnectionTarget, TransactionsConfig};
use csm_common::{CommonErrc, CoreErrorInfo, CoreResult, ForkEvent};

use crate::bridge::SyncBridge;
use crate::cache::{ConnectionLease, EvictionReport, Fingerprint, PersistentConnectionCache};
use crate::config::CacheConfig;
use crate::fork::{ForkAware, ForkCoordinator, ForkReport, ForkTarget};
use crate::metrics::{BridgeMetrics, MetricsSnapshot};
use crate::transactions::TransactionSession;

pub struct CacheService {
    cache: PersistentConnectionCache,
    transactions: Vec<Weak<TransactionSession>>,
    fork: ForkCoordinator,
    metrics: Arc<BridgeMetrics>,
    shut_down: bool,
}

impl CacheService {
    /// Validates `config` and creates an empty service.
    pub fn startup(config: CacheConfig, factory: Arc<dyn ClusterCoreFactory>) -> CoreResult<Self> {
        config.validate()?;
        let metrics = Arc::new(BridgeMetrics::new());
        info!(
            max_connections = ?config.max_connections,
            idle_timeout_ms = config.idle_timeout.as_millis() as u64,
            admission = ?config.admission,
            "cache service started"
        );
        Ok(CacheService {
            cache: PersistentConnectionCache::new(config, factory, SyncBridge::new(Arc::clone(&metrics))),
            transactions: Vec::new(),
            fork: ForkCoordinator::new(),
            metrics,
            shut_down: false,
        })
    }

    /// Leases the connection for `target`, keyed by its derived fingerprint.
    pub fn connect(&mut self, target: &ConnectionTarget) -> CoreResult<ConnectionLease> {
        self.connect_at(Fingerprint::derive(target), target, Instant::now())
    }

    /// Leases the connection for an explicit fingerprint as of `now`.
    pub fn connect_at(
        &mut self,
        fingerprint: Fingerprint,
        target: &ConnectionTarget,
        now: Instant,
    ) -> CoreResult<ConnectionLease> {
        self.ensure_running()?;
        self.cache.acquire_at(fingerprint, target, now)
    }

    /// Creates transaction machinery on a leased connection and tracks it for
    /// fork handling.
    pub fn begin_transactions(
        &mut self,
        lease: ConnectionLease,
        config: TransactionsConfig,
    ) -> CoreResult<Arc<TransactionSession>> {
        self.ensure_running()?;
        let session = TransactionSession::new(lease, config)?;
        self.transactions.push(Arc::downgrade(&session));
        Ok(session)
    }

    pub fn end_of_request(&mut self) -> EvictionReport {
        self.end_of_request_at(Instant::now())
    }

    /// Per-request housekeeping: forget dead transaction sessions and evict
    /// idle connections.
    pub fn end_of_request_at(&mut self, now: Instant) -> EvictionReport {
        self.transactions.retain(|session| session.strong_count() > 0);
        self.cache.evict_expired(now)
    }

    /// Runs one fork phase over every cached connection and live transaction
    /// session.
    pub fn notify_fork(&mut self, event: ForkEvent) -> ForkReport {
        let sessions = self.cache.sessions();
        let transactions = self.live_transaction_sessions();
        let connections: Vec<&dyn ForkAware> = sessions
            .iter()
            .map(|session| session.as_ref() as &dyn ForkAware)
            .collect();
        let transactions: Vec<&dyn ForkAware> = transactions
            .iter()
            .map(|session| session.as_ref() as &dyn ForkAware)
            .collect();
        let report = self.fork.notify(event, &connections, &transactions);
        self.discard_unresumed(&report);
        report
    }

    /// Connections whose I/O thread could not be restarted are unusable;
    /// drop them so the next lookup reconnects.
    fn discard_unresumed(&mut self, report: &ForkReport) {
        for failure in &report.failures {
            if failure.target == ForkTarget::Connection {
                self.cache.discard(&Fingerprint::new(failure.label.clone()));
            }
        }
    }

    /// Closes every transaction session and stops every cached connection.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for session in self.live_transaction_sessions() {
            session.close();
        }
        self.transactions.clear();
        self.cache.shutdown();
        info!("cache service shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache(&self) -> &PersistentConnectionCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut PersistentConnectionCache {
        &mut self.cache
    }

    pub fn live_transactions(&self) -> usize {
        self.transactions
            .iter()
            .filter(|session| session.strong_count() > 0)
            .count()
    }

    fn live_transaction_sessions(&self) -> Vec<Arc<TransactionSession>> {
        self.transactions.iter().filter_map(Weak::upgrade).collect()
    }

    fn ensure_running(&self) -> CoreResult<()> {
        if self.shut_down {
            return Err(CoreErrorInfo::new(
                CommonErrc::RequestCanceled,
                "cache service has been shut down",
            ));
        }
        Ok(())
    }
}

impl Drop for CacheService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csm_cluster::{Credentials, LoopbackCluster};
    use csm_common::ErrorCode;
    use std::time::Duration;

    use crate::fork::ForkFailure;

    fn target() -> ConnectionTarget {
        ConnectionTarget::new(
            "couchbase://127.0.0.1",
            Credentials {
                username: "Administrator".into(),
                password: "password".into(),
            },
        )
    }

    #[test]
    fn connect_after_shutdown_is_rejected() {
        let cluster = LoopbackCluster::new();
        let mut service = CacheService::startup(CacheConfig::default(), Arc::new(cluster.clone())).unwrap();
        let lease = service.connect(&target()).unwrap();
        assert_eq!(lease.fingerprint(), &Fingerprint::derive(&target()));

        service.shutdown();
        service.shutdown();
        let err = service.connect(&target()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Common(CommonErrc::RequestCanceled));
        assert_eq!(cluster.open_cores(), 0);
    }

    #[test]
    fn invalid_config_fails_startup() {
        let mut config = CacheConfig::default();
        config.session.close_timeout = Duration::ZERO;
        let err = CacheService::startup(config, Arc::new(LoopbackCluster::new()))
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::Common(CommonErrc::InvalidArgument));
    }

    #[test]
    fn connections_that_fail_to_resume_are_discarded() {
        let cluster = LoopbackCluster::new();
        let mut service = CacheService::startup(CacheConfig::default(), Arc::new(cluster.clone())).unwrap();
        let lease = service.connect(&target()).unwrap();
        let fingerprint = lease.fingerprint().clone();
        drop(lease);

        service.notify_fork(ForkEvent::Prepare);
        let stale = service.cache().session(&fingerprint).unwrap();
        let report = ForkReport {
            visits: Vec::new(),
            failures: vec![ForkFailure {
                target: ForkTarget::Connection,
                label: fingerprint.to_string(),
                error: CoreErrorInfo::new(CommonErrc::InternalServerFailure, "unable to start I/O thread"),
            }],
        };
        service.discard_unresumed(&report);

        assert!(service.cache().session(&fingerprint).is_none());
        assert!(!stale.is_open());
        let lease = service.connect(&target()).unwrap();
        assert!(!lease.is_cache_hit());
        assert!(lease.is_running());
    }

    #[test]
    fn dropped_transaction_sessions_are_forgotten() {
        let cluster = LoopbackCluster::new();
        let mut service = CacheService::startup(CacheConfig::default(), Arc::new(cluster)).unwrap();
        let lease = service.connect(&target()).unwrap();
        let transactions = service
            .begin_transactions(lease, TransactionsConfig::default())
            .unwrap();
        assert_eq!(service.live_transactions(), 1);

        drop(transactions);
        service.end_of_request();
        assert_eq!(service.live_transactions(), 0);
        assert!(service.metrics().calls_total >= 2);
    }
}
