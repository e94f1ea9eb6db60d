//! # Fork Coordination
//!
//! Purpose: Drive cached connections and transaction sessions through the
//! three fork phases in dependency order.
//!
//! ## Design Principles
//! 1. **Dependency Order**: Transactions depend on connections, so `prepare`
//!    quiesces transactions first and `parent`/`child` resume them last.
//! 2. **One Prepare**: A second `prepare` without a resume in between is
//!    ignored with a warning.
//! 3. **Visit Everything**: A resume failure on one entry is recorded and the
//!    remaining entries are still resumed.
//!
//! ## Phases
//!
//! ```text
//! prepare: transactions.prepare_fork -> connections.prepare_fork
//! parent:  connections.resume(parent) -> transactions.resume(parent)
//! child:   connections.resume(child)  -> transactions.resume(child)
//! ```

use tracing::{info, warn};

use csm_common::{CoreErrorInfo, CoreResult, ForkEvent};

use crate::session::ConnectionSession;
use crate::transactions::TransactionSession;

/// Something that must be stopped before a fork and restarted after it.
pub trait ForkAware {
    /// Name used in logs and visit records.
    fn fork_label(&self) -> String;

    fn prepare_fork(&self);

    fn resume_after_fork(&self, event: ForkEvent) -> CoreResult<()>;
}

impl ForkAware for ConnectionSession {
    fn fork_label(&self) -> String {
        self.fingerprint().to_string()
    }

    fn prepare_fork(&self) {
        self.pause_for_fork();
    }

    fn resume_after_fork(&self, event: ForkEvent) -> CoreResult<()> {
        ConnectionSession::resume_after_fork(self, event)
    }
}

impl ForkAware for TransactionSession {
    fn fork_label(&self) -> String {
        self.lease().fingerprint().to_string()
    }

    fn prepare_fork(&self) {
        TransactionSession::prepare_fork(self);
    }

    fn resume_after_fork(&self, event: ForkEvent) -> CoreResult<()> {
        TransactionSession::resume_after_fork(self, event);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkTarget {
    Transactions,
    Connection,
}

/// One hook invocation made by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkVisit {
    pub target: ForkTarget,
    pub label: String,
    pub event: ForkEvent,
}

/// A resume hook that failed.
#[derive(Debug, Clone)]
pub struct ForkFailure {
    pub target: ForkTarget,
    pub label: String,
    pub error: CoreErrorInfo,
}

#[derive(Debug, Default)]
pub struct ForkReport {
    pub visits: Vec<ForkVisit>,
    pub failures: Vec<ForkFailure>,
}

#[derive(Debug, Default)]
pub struct ForkCoordinator {
    prepared: bool,
}

impl ForkCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between `prepare` and the following resume.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Runs one fork phase over every entry.
    pub fn notify(
        &mut self,
        event: ForkEvent,
        connections: &[&dyn ForkAware],
        transactions: &[&dyn ForkAware],
    ) -> ForkReport {
        let mut report = ForkReport::default();
        match event {
            ForkEvent::Prepare => {
                if self.prepared {
                    warn!("fork prepare requested twice; ignoring");
                    return report;
                }
                self.prepared = true;
                info!(
                    connections = connections.len(),
                    transactions = transactions.len(),
                    "preparing for fork"
                );
                for entry in transactions {
                    entry.prepare_fork();
                    report.visit(ForkTarget::Transactions, *entry, event);
                }
                for entry in connections {
                    entry.prepare_fork();
                    report.visit(ForkTarget::Connection, *entry, event);
                }
            }
            ForkEvent::Parent | ForkEvent::Child => {
                if !self.prepared {
                    warn!(%event, "fork resume without a preceding prepare");
                }
                self.prepared = false;
                info!(%event, "resuming after fork");
                for entry in connections {
                    report.resume(ForkTarget::Connection, *entry, event);
                }
                for entry in transactions {
                    report.resume(ForkTarget::Transactions, *entry, event);
                }
            }
        }
        report
    }
}

impl ForkReport {
    fn visit(&mut self, target: ForkTarget, entry: &dyn ForkAware, event: ForkEvent) {
        self.visits.push(ForkVisit {
            target,
            label: entry.fork_label(),
            event,
        });
    }

    fn resume(&mut self, target: ForkTarget, entry: &dyn ForkAware, event: ForkEvent) {
        if let Err(err) = entry.resume_after_fork(event) {
            warn!(label = %entry.fork_label(), error = %err, "resume after fork failed");
            self.failures.push(ForkFailure {
                target,
                label: entry.fork_label(),
                error: err,
            });
        }
        self.visit(target, entry, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_resume: bool,
    }

    impl ForkAware for Recorder {
        fn fork_label(&self) -> String {
            self.label.to_string()
        }

        fn prepare_fork(&self) {
            self.log.lock().unwrap().push(format!("{}:prepare", self.label));
        }

        fn resume_after_fork(&self, event: ForkEvent) -> CoreResult<()> {
            self.log.lock().unwrap().push(format!("{}:{}", self.label, event));
            if self.fail_resume {
                return Err(CoreErrorInfo::new(
                    csm_common::CommonErrc::InternalServerFailure,
                    "unable to start I/O thread",
                ));
            }
            Ok(())
        }
    }

    #[test]
    fn transactions_stop_first_and_start_last() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connection = Recorder { label: "conn", log: Arc::clone(&log), fail_resume: false };
        let transactions = Recorder { label: "txn", log: Arc::clone(&log), fail_resume: false };
        let mut coordinator = ForkCoordinator::new();

        coordinator.notify(ForkEvent::Prepare, &[&connection], &[&transactions]);
        coordinator.notify(ForkEvent::Parent, &[&connection], &[&transactions]);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["txn:prepare", "conn:prepare", "conn:parent", "txn:parent"]
        );
    }

    #[test]
    fn double_prepare_is_ignored() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connection = Recorder { label: "conn", log: Arc::clone(&log), fail_resume: false };
        let mut coordinator = ForkCoordinator::new();

        assert_eq!(coordinator.notify(ForkEvent::Prepare, &[&connection], &[]).visits.len(), 1);
        assert!(coordinator.notify(ForkEvent::Prepare, &[&connection], &[]).visits.is_empty());
        assert!(coordinator.is_prepared());

        let report = coordinator.notify(ForkEvent::Child, &[&connection], &[]);
        assert_eq!(report.visits[0].event, ForkEvent::Child);
        assert!(!coordinator.is_prepared());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn failed_resume_is_reported_and_the_rest_still_resume() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let broken = Recorder { label: "broken", log: Arc::clone(&log), fail_resume: true };
        let healthy = Recorder { label: "healthy", log: Arc::clone(&log), fail_resume: false };
        let mut coordinator = ForkCoordinator::new();

        coordinator.notify(ForkEvent::Prepare, &[&broken, &healthy], &[]);
        let report = coordinator.notify(ForkEvent::Child, &[&broken, &healthy], &[]);

        assert_eq!(report.visits.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].target, ForkTarget::Connection);
        assert_eq!(report.failures[0].label, "broken");
        assert!(log.lock().unwrap().contains(&"healthy:child".to_string()));
    }
}
