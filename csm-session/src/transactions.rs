//! # Transaction Sessions
//!
//! Purpose: Blocking wrappers over the transaction machinery of one cached
//! connection.
//!
//! ## Design Principles
//! 1. **Same Bridge**: Every transaction step, including the multi-round-trip
//!    commit, is one `SyncBridge` call.
//! 2. **Connection Pinned**: A `TransactionSession` holds a lease, so its
//!    connection cannot be evicted while the session lives.
//! 3. **Transaction Context**: Failures carry the cause, the failure type, the
//!    retry/rollback advice and, when known, the transaction result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use csm_cluster::{
    Completion, QueryRequest, QueryResult, TransactionContext, TransactionDocument,
    TransactionFailure, TransactionOpFailure, TransactionOptions, Transactions,
    TransactionsConfig, TxnOutcome,
};
use csm_common::{
    CommonErrc, CoreErrorInfo, CoreResult, DocumentId, ErrorContext, ForkEvent,
    SourceLocation, TransactionErrc, TransactionErrorContext, TransactionFailureType,
    TransactionResult,
};

use crate::bridge::{submit_with, SyncBridge};
use crate::cache::ConnectionLease;
use crate::session::failure_message;

/// Transaction machinery bound to one cached connection.
pub struct TransactionSession {
    lease: ConnectionLease,
    transactions: Arc<dyn Transactions>,
    bridge: SyncBridge,
    config: TransactionsConfig,
    closed: AtomicBool,
}

impl TransactionSession {
    /// Creates the transaction machinery on the leased connection.
    pub fn new(lease: ConnectionLease, config: TransactionsConfig) -> CoreResult<Arc<Self>> {
        let bridge = lease.bridge().clone();
        let core = Arc::clone(lease.core());
        let requested = config.clone();
        let outcome = bridge.call_outcome(submit_with(move |done| core.transactions(requested, done)))?;
        let transactions = outcome.map_err(|failure| {
            CoreErrorInfo::new(failure.code, "unable to create transactions")
                .with_context(ErrorContext::http(&failure))
        })?;
        debug!(fingerprint = %lease.fingerprint(), "transactions created");
        Ok(Arc::new(TransactionSession {
            lease,
            transactions,
            bridge,
            config,
            closed: AtomicBool::new(false),
        }))
    }

    /// Starts a logical transaction and its first attempt.
    pub fn begin(&self, options: TransactionOptions) -> CoreResult<TransactionAttempt> {
        if self.is_closed() {
            return Err(CoreErrorInfo::new(
                CommonErrc::RequestCanceled,
                "transaction session is closed",
            ));
        }
        let attempt = TransactionAttempt {
            context: self.transactions.begin(options)?,
            bridge: self.bridge.clone(),
        };
        attempt.new_attempt()?;
        Ok(attempt)
    }

    /// Quiesces background cleanup ahead of a fork.
    pub fn prepare_fork(&self) {
        self.transactions.notify_fork(ForkEvent::Prepare);
    }

    pub fn resume_after_fork(&self, event: ForkEvent) {
        self.transactions.notify_fork(event);
    }

    /// Stops the machinery; later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transactions = Arc::clone(&self.transactions);
        let closed = self.bridge.call_within(
            submit_with(move |done| {
                transactions.close(done);
                Ok(())
            }),
            self.lease.settings().close_timeout,
        );
        match closed {
            Ok(Some(())) => debug!(fingerprint = %self.lease.fingerprint(), "transactions closed"),
            Ok(None) => warn!(fingerprint = %self.lease.fingerprint(), "transactions did not close in time"),
            Err(err) => warn!(fingerprint = %self.lease.fingerprint(), error = %err, "transactions close failed"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn lease(&self) -> &ConnectionLease {
        &self.lease
    }

    pub fn config(&self) -> &TransactionsConfig {
        &self.config
    }
}

impl Drop for TransactionSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// One logical transaction.
pub struct TransactionAttempt {
    context: Arc<dyn TransactionContext>,
    bridge: SyncBridge,
}

impl TransactionAttempt {
    pub fn transaction_id(&self) -> String {
        self.context.transaction_id()
    }

    /// Discards staged work and starts over.
    pub fn new_attempt(&self) -> CoreResult<()> {
        let id = self.transaction_id();
        self.step("new attempt", &id, |context, done| context.new_attempt(done))
    }

    pub fn get(&self, id: &DocumentId) -> CoreResult<TransactionDocument> {
        let target = id.clone();
        self.step("get", &id.key, move |context, done| context.get(target, done))
    }

    pub fn insert(&self, id: &DocumentId, content: Bytes) -> CoreResult<TransactionDocument> {
        let target = id.clone();
        self.step("insert", &id.key, move |context, done| {
            context.insert(target, content, done)
        })
    }

    pub fn replace(
        &self,
        document: &TransactionDocument,
        content: Bytes,
    ) -> CoreResult<TransactionDocument> {
        let target = document.clone();
        self.step("replace", &document.id.key, move |context, done| {
            context.replace(target, content, done)
        })
    }

    pub fn remove(&self, document: &TransactionDocument) -> CoreResult<()> {
        let target = document.clone();
        self.step("remove", &document.id.key, move |context, done| {
            context.remove(target, done)
        })
    }

    pub fn query(&self, request: QueryRequest) -> CoreResult<QueryResult> {
        let statement = request.statement.clone();
        self.step("query", &statement, move |context, done| {
            context.query(request, done)
        })
    }

    pub fn rollback(&self) -> CoreResult<()> {
        let id = self.transaction_id();
        self.step("rollback", &id, |context, done| context.rollback(done))
    }

    /// Commits the attempt.
    ///
    /// **Output**: the transaction result, or a failure whose code is the
    /// terminal transaction outcome (`transaction_failed`,
    /// `transaction_expired`, `transaction_commit_ambiguous`, ...).
    #[track_caller]
    pub fn commit(&self) -> CoreResult<TransactionResult> {
        let location = SourceLocation::caller();
        let id = self.transaction_id();
        let context = Arc::clone(&self.context);
        let outcome = self
            .bridge
            .call_outcome(submit_with(move |done| {
                context.finalize(done);
                Ok(())
            }))
            .map_err(|err| relocate(err, location))?;
        outcome.map_err(|failure| commit_error(&id, failure, location))
    }

    #[track_caller]
    fn step<T, F>(&self, operation: &str, name: &str, submit: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TransactionContext, Completion<TxnOutcome<T>>),
    {
        let location = SourceLocation::caller();
        let context = Arc::clone(&self.context);
        let outcome = self
            .bridge
            .call_outcome(submit_with(move |done| {
                submit(context.as_ref(), done);
                Ok(())
            }))
            .map_err(|err| relocate(err, location))?;
        outcome.map_err(|failure| operation_error(operation, name, failure, location))
    }
}

fn relocate(mut err: CoreErrorInfo, location: SourceLocation) -> CoreErrorInfo {
    err.location = location;
    err
}

fn operation_error(
    operation: &str,
    name: &str,
    failure: TransactionOpFailure,
    location: SourceLocation,
) -> CoreErrorInfo {
    debug!(operation, cause = failure.cause.name(), detail = %failure.message, "transaction step failed");
    CoreErrorInfo {
        code: TransactionErrc::OperationFailed.into(),
        location,
        message: failure_message(&format!("transaction {}", operation), name),
        context: ErrorContext::transaction(TransactionErrorContext {
            cause: Some(failure.cause.name().to_string()),
            failure_type: Some(failure.failure_type),
            result: None,
            should_not_retry: failure.should_not_retry,
            should_not_rollback: failure.should_not_rollback,
        }),
    }
}

fn commit_error(id: &str, failure: TransactionFailure, location: SourceLocation) -> CoreErrorInfo {
    let failure_type = match failure.code {
        TransactionErrc::Expired => TransactionFailureType::Expiry,
        TransactionErrc::CommitAmbiguous => TransactionFailureType::CommitAmbiguous,
        _ => TransactionFailureType::Fail,
    };
    debug!(transaction = id, code = failure.code.name(), detail = %failure.message, "commit failed");
    CoreErrorInfo {
        code: failure.code.into(),
        location,
        message: failure_message("transaction commit", id),
        context: ErrorContext::transaction(TransactionErrorContext {
            cause: failure.cause.map(|cause| cause.name().to_string()),
            failure_type: Some(failure_type),
            result: failure.result,
            should_not_retry: true,
            should_not_rollback: failure_type != TransactionFailureType::Fail,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csm_common::{ErrorCode, KeyValueErrc};

    #[test]
    fn step_failures_become_operation_failed() {
        let mut failure = TransactionOpFailure::new(KeyValueErrc::DocumentExists, "exists");
        failure.should_not_retry = true;
        let err = operation_error("insert", "k1", failure, SourceLocation::caller());

        assert_eq!(err.code, ErrorCode::Transaction(TransactionErrc::OperationFailed));
        assert_eq!(err.message, "unable to execute transaction insert \"k1\"");
        match err.context {
            ErrorContext::Transaction(context) => {
                assert_eq!(context.cause.as_deref(), Some("document_exists"));
                assert_eq!(context.failure_type, Some(TransactionFailureType::Fail));
                assert!(context.should_not_retry);
                assert!(!context.should_not_rollback);
            }
            other => panic!("unexpected context {:?}", other),
        }
    }

    #[test]
    fn expired_commit_reports_expiry_type() {
        let failure = TransactionFailure {
            code: TransactionErrc::Expired,
            cause: None,
            message: "deadline passed".into(),
            result: Some(TransactionResult {
                transaction_id: "t1".into(),
                unstaging_complete: false,
            }),
        };
        let err = commit_error("t1", failure, SourceLocation::caller());
        assert_eq!(err.code, ErrorCode::Transaction(TransactionErrc::Expired));
        match err.context {
            ErrorContext::Transaction(context) => {
                assert_eq!(context.failure_type, Some(TransactionFailureType::Expiry));
                assert_eq!(context.result.unwrap().transaction_id, "t1");
            }
            other => panic!("unexpected context {:?}", other),
        }
    }
}
