//! # Cluster Core Interface
//!
//! Purpose: The narrow set of traits the session layer consumes from a
//! cluster-client library: an event loop (`IoContext`), an asynchronous
//! cluster handle (`ClusterCore`) and the transaction objects layered on it.
//!
//! ## Design Principles
//! 1. **Callback Based**: Every asynchronous entry point takes a
//!    `Completion`; synchronous validation failures are returned directly.
//! 2. **Thread Safe Issue**: Requests may be issued from any thread while the
//!    event loop runs on another; destruction is the caller's problem.
//! 3. **Fork Aware**: Both the event loop and the transaction machinery can be
//!    told about process duplication.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use csm_common::{
    CoreResult, DocumentId, DurabilityLevel, ErrorCode, ForkEvent, TransactionErrc,
    TransactionFailureType, TransactionResult,
};

use crate::completion::Completion;
use crate::request::{ConnectionTarget, Outcome, QueryRequest, QueryResult, Request, Response};

/// Event loop that services a cluster handle's I/O.
pub trait IoContext: Send + Sync {
    /// Runs the loop on the calling thread until `stop` is called.
    fn run(&self);

    /// Makes a running (or the next) `run` call return.
    fn stop(&self);

    /// Clears a previous `stop` so `run` can be entered again.
    fn restart(&self);

    /// Informs the loop about a fork phase. Called while the loop is stopped.
    fn notify_fork(&self, event: ForkEvent);
}

/// Asynchronous cluster handle.
pub trait ClusterCore: Send + Sync {
    /// Event loop this handle's I/O runs on.
    fn io(&self) -> Arc<dyn IoContext>;

    /// Bootstraps the connection.
    fn open(&self, target: &ConnectionTarget, done: Completion<Outcome<()>>) -> CoreResult<()>;

    /// Gracefully closes every connection of the handle.
    fn close(&self, done: Completion<()>);

    /// Executes one request.
    fn execute(&self, request: Request, done: Completion<Outcome<Response>>) -> CoreResult<()>;

    /// Creates the transaction machinery bound to this handle.
    fn transactions(
        &self,
        config: TransactionsConfig,
        done: Completion<Outcome<Arc<dyn Transactions>>>,
    ) -> CoreResult<()>;
}

/// Creates cluster handles; one per connection session.
pub trait ClusterCoreFactory: Send + Sync {
    fn create(&self) -> CoreResult<Arc<dyn ClusterCore>>;
}

/// Configuration for the transaction machinery of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionsConfig {
    pub durability: DurabilityLevel,
    pub timeout: Duration,
    pub cleanup_window: Duration,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        TransactionsConfig {
            durability: DurabilityLevel::Majority,
            timeout: Duration::from_secs(15),
            cleanup_window: Duration::from_secs(60),
        }
    }
}

/// Per-transaction overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub durability: Option<DurabilityLevel>,
    pub timeout: Option<Duration>,
}

/// A document as seen inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionDocument {
    pub id: DocumentId,
    #[serde(serialize_with = "serialize_content")]
    pub content: Bytes,
    pub cas: u64,
}

/// A failed step inside a transaction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOpFailure {
    /// Underlying failure, e.g. `document_exists`.
    pub cause: ErrorCode,
    pub message: String,
    pub should_not_retry: bool,
    pub should_not_rollback: bool,
    pub failure_type: TransactionFailureType,
}

impl TransactionOpFailure {
    pub fn new(cause: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        TransactionOpFailure {
            cause: cause.into(),
            message: message.into(),
            should_not_retry: false,
            should_not_rollback: false,
            failure_type: TransactionFailureType::Fail,
        }
    }
}

/// Terminal failure of a whole transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFailure {
    pub code: TransactionErrc,
    pub cause: Option<ErrorCode>,
    pub message: String,
    pub result: Option<TransactionResult>,
}

pub type TxnOutcome<T> = Result<T, TransactionOpFailure>;

/// Transaction machinery of one connection (attempt factory plus the
/// background cleanup of lost attempts).
pub trait Transactions: Send + Sync {
    /// Starts a logical transaction.
    fn begin(&self, options: TransactionOptions) -> CoreResult<Arc<dyn TransactionContext>>;

    /// Quiesces (`prepare`) or resumes (`parent`/`child`) background cleanup.
    fn notify_fork(&self, event: ForkEvent);

    /// Stops background cleanup for good.
    fn close(&self, done: Completion<()>);
}

/// One logical transaction, possibly spanning several attempts.
pub trait TransactionContext: Send + Sync {
    fn transaction_id(&self) -> String;

    fn new_attempt(&self, done: Completion<TxnOutcome<()>>);

    fn get(&self, id: DocumentId, done: Completion<TxnOutcome<TransactionDocument>>);

    fn insert(
        &self,
        id: DocumentId,
        content: Bytes,
        done: Completion<TxnOutcome<TransactionDocument>>,
    );

    fn replace(
        &self,
        document: TransactionDocument,
        content: Bytes,
        done: Completion<TxnOutcome<TransactionDocument>>,
    );

    fn remove(&self, document: TransactionDocument, done: Completion<TxnOutcome<()>>);

    fn query(&self, request: QueryRequest, done: Completion<TxnOutcome<QueryResult>>);

    /// Commits the current attempt; may take several round trips.
    fn finalize(&self, done: Completion<Result<TransactionResult, TransactionFailure>>);

    fn rollback(&self, done: Completion<TxnOutcome<()>>);
}

fn serialize_content<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}
