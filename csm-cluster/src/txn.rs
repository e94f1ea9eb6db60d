//! # Loopback Transactions
//!
//! Purpose: Transaction machinery for the loopback core. Mutations are staged
//! per attempt and only reach the document store when the attempt commits;
//! a rollback or a failed commit discards them.
//!
//! ## Design Principles
//! 1. **Staged Writes**: Reads inside an attempt see its own staged writes;
//!    nobody else does until `finalize` applies them.
//! 2. **Plain Apply**: A commit writes staged mutations in order with the
//!    store's own CAS checks; there is no cross-document atomicity.
//! 3. **One Deadline**: The transaction timeout runs from `begin` across all
//!    attempts; any step after it reports an `expiry` failure.
//! 4. **Fork Hooks**: `notify_fork` only records the event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use csm_common::{
    CommonErrc, CoreErrorInfo, CoreResult, DocumentId, DurabilityLevel, ErrorCode, ForkEvent,
    KeyValueErrc, TransactionErrc, TransactionFailureType, TransactionResult,
};

use crate::completion::Completion;
use crate::core::{
    TransactionContext, TransactionDocument, TransactionFailure, TransactionOpFailure,
    TransactionOptions, Transactions, TransactionsConfig, TxnOutcome,
};
use crate::loopback::{CoreShared, ForkComponent};
use crate::request::{MutationKind, QueryRequest, QueryResult};
use crate::store::Write;

/// Transaction machinery bound to one loopback handle.
pub struct LoopbackTransactions {
    core: Arc<CoreShared>,
    config: TransactionsConfig,
    closed: AtomicBool,
    next_transaction: AtomicU64,
}

impl LoopbackTransactions {
    pub(crate) fn new(core: Arc<CoreShared>, config: TransactionsConfig) -> Self {
        tracing::debug!(
            core = core.stats.id(),
            durability = %config.durability,
            timeout_ms = config.timeout.as_millis() as u64,
            "loopback transactions started"
        );
        LoopbackTransactions {
            core,
            config,
            closed: AtomicBool::new(false),
            next_transaction: AtomicU64::new(1),
        }
    }
}

impl Transactions for LoopbackTransactions {
    fn begin(&self, options: TransactionOptions) -> CoreResult<Arc<dyn TransactionContext>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreErrorInfo::new(
                CommonErrc::RequestCanceled,
                "transactions have been closed",
            ));
        }
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        if timeout.is_zero() {
            return Err(CoreErrorInfo::invalid_argument(
                "transaction timeout must be positive",
            ));
        }

        let sequence = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        let inner = ContextInner {
            id: format!("{:08x}-{:04x}-{:08x}", std::process::id(), self.core.stats.id(), sequence),
            core: Arc::clone(&self.core),
            deadline: Instant::now() + timeout,
            durability: options.durability.unwrap_or(self.config.durability),
            attempt: Mutex::new(Attempt::default()),
        };
        Ok(Arc::new(LoopbackTransactionContext {
            inner: Arc::new(inner),
        }))
    }

    fn notify_fork(&self, event: ForkEvent) {
        self.core
            .state
            .record_fork(self.core.stats.id(), ForkComponent::Transactions, event);
        tracing::debug!(%event, "loopback transactions notified of fork");
    }

    fn close(&self, done: Completion<()>) {
        self.closed.store(true, Ordering::Release);
        done.complete(());
    }
}

#[derive(Debug, Clone)]
enum Staged {
    Insert(Bytes),
    Replace { content: Bytes, cas: u64 },
    Remove { cas: u64 },
}

#[derive(Debug, Default)]
struct Attempt {
    number: u32,
    staged: Vec<(DocumentId, Staged)>,
    finished: bool,
}

impl Attempt {
    fn staged(&self, id: &DocumentId) -> Option<&Staged> {
        self.staged.iter().find(|(staged, _)| staged == id).map(|(_, op)| op)
    }

    fn stage(&mut self, id: DocumentId, op: Staged) {
        match self.staged.iter_mut().find(|(staged, _)| *staged == id) {
            Some(slot) => slot.1 = op,
            None => self.staged.push((id, op)),
        }
    }

    fn unstage(&mut self, id: &DocumentId) {
        self.staged.retain(|(staged, _)| staged != id);
    }
}

struct ContextInner {
    id: String,
    core: Arc<CoreShared>,
    deadline: Instant,
    durability: DurabilityLevel,
    attempt: Mutex<Attempt>,
}

/// One logical transaction on the loopback cluster.
pub struct LoopbackTransactionContext {
    inner: Arc<ContextInner>,
}

impl LoopbackTransactionContext {
    /// Runs one attempt step on the handle's event loop.
    fn step<T, F>(&self, done: Completion<TxnOutcome<T>>, op: F)
    where
        T: Send + 'static,
        F: FnOnce(&ContextInner, &mut Attempt) -> TxnOutcome<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.core.io.spawn(async move {
            let outcome = inner.guard().and_then(|_| {
                let mut attempt = inner.attempt.lock();
                if attempt.finished {
                    let mut failure = TransactionOpFailure::new(
                        CommonErrc::RequestCanceled,
                        "attempt has already finished",
                    );
                    failure.should_not_retry = true;
                    failure.should_not_rollback = true;
                    return Err(failure);
                }
                op(&*inner, &mut *attempt)
            });
            done.complete(outcome);
        });
    }
}

impl ContextInner {
    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn guard(&self) -> TxnOutcome<()> {
        if self.expired() {
            let mut failure = TransactionOpFailure::new(
                TransactionErrc::Expired,
                "transaction expired",
            );
            failure.failure_type = TransactionFailureType::Expiry;
            failure.should_not_retry = true;
            return Err(failure);
        }
        match self.core.state.take_txn_failure() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Live (cas, content) of a document in the store.
    fn read_store(&self, id: &DocumentId) -> Result<(u64, Bytes), ErrorCode> {
        self.core
            .state
            .store
            .get(id, Instant::now())
            .map(|found| (found.cas, found.value))
    }

    fn result(&self) -> TransactionResult {
        TransactionResult {
            transaction_id: self.id.clone(),
            unstaging_complete: true,
        }
    }

    /// Writes the staged mutations in staging order.
    ///
    /// A failure before the first write fails the transaction; a failure
    /// after it leaves unstaging incomplete.
    fn commit(&self, attempt: &mut Attempt) -> Result<TransactionResult, TransactionFailure> {
        let now = Instant::now();
        for (applied, (id, op)) in attempt.staged.drain(..).enumerate() {
            let written = match self.core.state.bucket_replicas(&id.bucket) {
                None => Err(CommonErrc::BucketNotFound.into()),
                Some(replicas) if self.durability.required_replicas() > replicas => {
                    Err(KeyValueErrc::DurabilityImpossible.into())
                }
                Some(_) => match op {
                    Staged::Insert(content) => self
                        .core
                        .state
                        .store
                        .write(&id, staged_write(MutationKind::Insert, content, None), now)
                        .map(|_| ()),
                    Staged::Replace { content, cas } => self
                        .core
                        .state
                        .store
                        .write(&id, staged_write(MutationKind::Replace, content, Some(cas)), now)
                        .map(|_| ()),
                    Staged::Remove { cas } => {
                        self.core.state.store.remove(&id, Some(cas), now).map(|_| ())
                    }
                },
            };
            let Err(code) = written else {
                continue;
            };
            if applied == 0 {
                return Err(TransactionFailure {
                    code: TransactionErrc::Failed,
                    cause: Some(code),
                    message: format!("unable to commit {}", id),
                    result: None,
                });
            }
            tracing::warn!(transaction = %self.id, document = %id, error = %code, "unstaging incomplete");
            return Err(TransactionFailure {
                code: TransactionErrc::FailedPostCommit,
                cause: Some(code),
                message: format!("unable to unstage {}", id),
                result: Some(TransactionResult {
                    transaction_id: self.id.clone(),
                    unstaging_complete: false,
                }),
            });
        }
        Ok(self.result())
    }
}

fn staged_write(kind: MutationKind, value: Bytes, cas: Option<u64>) -> Write {
    Write {
        kind,
        value,
        flags: 0,
        expiry: None,
        cas,
    }
}

fn op_failure(cause: impl Into<ErrorCode>, message: String) -> TransactionOpFailure {
    TransactionOpFailure::new(cause, message)
}

impl TransactionContext for LoopbackTransactionContext {
    fn transaction_id(&self) -> String {
        self.inner.id.clone()
    }

    fn new_attempt(&self, done: Completion<TxnOutcome<()>>) {
        let inner = Arc::clone(&self.inner);
        self.inner.core.io.spawn(async move {
            let outcome = inner.guard().map(|_| {
                let mut attempt = inner.attempt.lock();
                attempt.number += 1;
                attempt.staged.clear();
                attempt.finished = false;
                tracing::debug!(transaction = %inner.id, attempt = attempt.number, "new attempt");
            });
            done.complete(outcome);
        });
    }

    fn get(&self, id: DocumentId, done: Completion<TxnOutcome<TransactionDocument>>) {
        self.step(done, move |inner, attempt| match attempt.staged(&id) {
            Some(Staged::Insert(content)) | Some(Staged::Replace { content, .. }) => {
                Ok(TransactionDocument {
                    content: content.clone(),
                    cas: 0,
                    id,
                })
            }
            Some(Staged::Remove { .. }) => Err(op_failure(
                KeyValueErrc::DocumentNotFound,
                format!("{} was removed in this transaction", id),
            )),
            None => match inner.read_store(&id) {
                Ok((cas, content)) => Ok(TransactionDocument { id, content, cas }),
                Err(code) => Err(op_failure(code, format!("unable to get {}", id))),
            },
        });
    }

    fn insert(&self, id: DocumentId, content: Bytes, done: Completion<TxnOutcome<TransactionDocument>>) {
        self.step(done, move |inner, attempt| {
            let staged = match attempt.staged(&id) {
                Some(Staged::Remove { cas }) => Staged::Replace {
                    content: content.clone(),
                    cas: *cas,
                },
                Some(_) => {
                    return Err(op_failure(
                        KeyValueErrc::DocumentExists,
                        format!("{} was already written in this transaction", id),
                    ))
                }
                None if inner.read_store(&id).is_ok() => {
                    return Err(op_failure(KeyValueErrc::DocumentExists, format!("{} already exists", id)));
                }
                None => Staged::Insert(content.clone()),
            };
            attempt.stage(id.clone(), staged);
            Ok(TransactionDocument { id, content, cas: 0 })
        });
    }

    fn replace(
        &self,
        document: TransactionDocument,
        content: Bytes,
        done: Completion<TxnOutcome<TransactionDocument>>,
    ) {
        self.step(done, move |inner, attempt| {
            let id = document.id;
            let staged = match attempt.staged(&id) {
                Some(Staged::Insert(_)) => Staged::Insert(content.clone()),
                Some(Staged::Replace { cas, .. }) => Staged::Replace {
                    content: content.clone(),
                    cas: *cas,
                },
                Some(Staged::Remove { .. }) => {
                    return Err(op_failure(
                        KeyValueErrc::DocumentNotFound,
                        format!("{} was removed in this transaction", id),
                    ))
                }
                None => {
                    let (cas, _) = inner
                        .read_store(&id)
                        .map_err(|code| op_failure(code, format!("unable to replace {}", id)))?;
                    if cas != document.cas {
                        return Err(op_failure(
                            CommonErrc::CasMismatch,
                            format!("{} changed since it was read", id),
                        ));
                    }
                    Staged::Replace {
                        content: content.clone(),
                        cas,
                    }
                }
            };
            attempt.stage(id.clone(), staged);
            Ok(TransactionDocument { id, content, cas: 0 })
        });
    }

    fn remove(&self, document: TransactionDocument, done: Completion<TxnOutcome<()>>) {
        self.step(done, move |inner, attempt| {
            let id = document.id;
            match attempt.staged(&id).cloned() {
                Some(Staged::Insert(_)) => attempt.unstage(&id),
                Some(Staged::Replace { cas, .. }) => attempt.stage(id, Staged::Remove { cas }),
                Some(Staged::Remove { .. }) => {
                    return Err(op_failure(
                        KeyValueErrc::DocumentNotFound,
                        format!("{} was already removed in this transaction", id),
                    ))
                }
                None => {
                    let (cas, _) = inner
                        .read_store(&id)
                        .map_err(|code| op_failure(code, format!("unable to remove {}", id)))?;
                    if cas != document.cas {
                        return Err(op_failure(
                            CommonErrc::CasMismatch,
                            format!("{} changed since it was read", id),
                        ));
                    }
                    attempt.stage(id, Staged::Remove { cas });
                }
            }
            Ok(())
        });
    }

    fn query(&self, request: QueryRequest, done: Completion<TxnOutcome<QueryResult>>) {
        self.step(done, move |inner, _attempt| {
            inner.core.state.run_query(&request).map_err(|failure| {
                let message = failure
                    .first_error
                    .as_ref()
                    .map(|first| first.message.clone())
                    .or_else(|| failure.message.clone())
                    .unwrap_or_else(|| format!("query failed: {}", request.statement));
                op_failure(failure.code, message)
            })
        });
    }

    fn finalize(&self, done: Completion<Result<TransactionResult, TransactionFailure>>) {
        let inner = Arc::clone(&self.inner);
        self.inner.core.io.spawn(async move {
            let mut attempt = inner.attempt.lock();
            let outcome = if attempt.finished {
                Err(TransactionFailure {
                    code: TransactionErrc::Failed,
                    cause: None,
                    message: "attempt has already finished".to_string(),
                    result: None,
                })
            } else if let Some(failure) = inner.core.state.take_commit_failure() {
                attempt.staged.clear();
                Err(failure)
            } else if inner.expired() {
                attempt.staged.clear();
                Err(TransactionFailure {
                    code: TransactionErrc::Expired,
                    cause: Some(TransactionErrc::Expired.into()),
                    message: "transaction expired before commit".to_string(),
                    result: None,
                })
            } else {
                let committed = inner.commit(&mut attempt);
                if committed.is_err() {
                    attempt.staged.clear();
                }
                committed
            };
            attempt.finished = true;
            drop(attempt);

            match &outcome {
                Ok(_) => tracing::debug!(transaction = %inner.id, "transaction committed"),
                Err(failure) => {
                    tracing::debug!(transaction = %inner.id, code = %failure.code.name(), "transaction failed")
                }
            }
            done.complete(outcome);
        });
    }

    fn rollback(&self, done: Completion<TxnOutcome<()>>) {
        let inner = Arc::clone(&self.inner);
        self.inner.core.io.spawn(async move {
            let mut attempt = inner.attempt.lock();
            let outcome = if attempt.finished {
                let mut failure = TransactionOpFailure::new(
                    CommonErrc::RequestCanceled,
                    "attempt has already finished",
                );
                failure.should_not_rollback = true;
                Err(failure)
            } else {
                let discarded = attempt.staged.len();
                attempt.staged.clear();
                attempt.finished = true;
                tracing::debug!(transaction = %inner.id, discarded, "attempt rolled back");
                Ok(())
            };
            drop(attempt);
            done.complete(outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_replaces_earlier_entry_for_same_document() {
        let mut attempt = Attempt::default();
        let id = DocumentId::in_default_collection("travel", "a");
        attempt.stage(id.clone(), Staged::Insert(Bytes::from_static(b"1")));
        attempt.stage(id.clone(), Staged::Remove { cas: 4 });
        assert_eq!(attempt.staged.len(), 1);
        assert!(matches!(attempt.staged(&id), Some(Staged::Remove { cas: 4 })));

        attempt.unstage(&id);
        assert!(attempt.staged(&id).is_none());
    }
}
