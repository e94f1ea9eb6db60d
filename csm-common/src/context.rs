//! # Error Contexts
//!
//! Purpose: Carry category-specific diagnostics alongside an error code and
//! render them into host-visible structured fields.
//!
//! ## Design Principles
//! 1. **Closed Sum Type**: `ErrorContext` is an enum with one payload per
//!    category; rendering is a single `match`.
//! 2. **Shared Retry Suffix**: Every non-empty, non-transaction context carries
//!    `RetryInfo`, rendered last with the same field names everywhere.
//! 3. **Builders Per Operation Type**: The cluster core reports a raw
//!    `ServiceFailure`; the `ErrorContext::key_value`/`query`/... builders pick
//!    the fields that matter for the operation that failed.
//! 4. **Deterministic Output**: Retry reasons are a `BTreeSet`, so rendering is
//!    deduplicated and ordered.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorCode;
use crate::types::DocumentId;

/// Why the core library retried a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    SocketNotAvailable,
    ServiceNotAvailable,
    NodeNotAvailable,
    KvNotMyVbucket,
    KvCollectionOutdated,
    KvErrorMapRetryIndicated,
    KvLocked,
    KvTemporaryFailure,
    KvSyncWriteInProgress,
    KvSyncWriteReCommitInProgress,
    ServiceResponseCodeIndicated,
    SocketClosedWhileInFlight,
    CircuitBreakerOpen,
    QueryPreparedStatementFailure,
    QueryIndexNotFound,
    AnalyticsTemporaryFailure,
    SearchTooManyRequests,
    ViewsTemporaryFailure,
    ViewsNoActivePartition,
    DoNotRetry,
    Unknown,
}

impl RetryReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            RetryReason::SocketNotAvailable => "socket_not_available",
            RetryReason::ServiceNotAvailable => "service_not_available",
            RetryReason::NodeNotAvailable => "node_not_available",
            RetryReason::KvNotMyVbucket => "kv_not_my_vbucket",
            RetryReason::KvCollectionOutdated => "kv_collection_outdated",
            RetryReason::KvErrorMapRetryIndicated => "kv_error_map_retry_indicated",
            RetryReason::KvLocked => "kv_locked",
            RetryReason::KvTemporaryFailure => "kv_temporary_failure",
            RetryReason::KvSyncWriteInProgress => "kv_sync_write_in_progress",
            RetryReason::KvSyncWriteReCommitInProgress => "kv_sync_write_re_commit_in_progress",
            RetryReason::ServiceResponseCodeIndicated => "service_response_code_indicated",
            RetryReason::SocketClosedWhileInFlight => "socket_closed_while_in_flight",
            RetryReason::CircuitBreakerOpen => "circuit_breaker_open",
            RetryReason::QueryPreparedStatementFailure => "query_prepared_statement_failure",
            RetryReason::QueryIndexNotFound => "query_index_not_found",
            RetryReason::AnalyticsTemporaryFailure => "analytics_temporary_failure",
            RetryReason::SearchTooManyRequests => "search_too_many_requests",
            RetryReason::ViewsTemporaryFailure => "views_temporary_failure",
            RetryReason::ViewsNoActivePartition => "views_no_active_partition",
            RetryReason::DoNotRetry => "do_not_retry",
            RetryReason::Unknown => "unknown",
        }
    }
}

/// Retry diagnostics shared by every request-level context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryInfo {
    pub last_dispatched_to: Option<String>,
    pub last_dispatched_from: Option<String>,
    pub retry_attempts: u32,
    pub retry_reasons: BTreeSet<RetryReason>,
}

impl RetryInfo {
    /// Records one more retry for `reason`.
    pub fn record(&mut self, reason: RetryReason) {
        self.retry_attempts = self.retry_attempts.saturating_add(1);
        self.retry_reasons.insert(reason);
    }

    fn render_into(&self, out: &mut Map<String, Value>) {
        if let Some(to) = &self.last_dispatched_to {
            out.insert("lastDispatchedTo".into(), Value::from(to.as_str()));
        }
        if let Some(from) = &self.last_dispatched_from {
            out.insert("lastDispatchedFrom".into(), Value::from(from.as_str()));
        }
        out.insert("retryAttempts".into(), Value::from(self.retry_attempts));
        if !self.retry_reasons.is_empty() {
            let reasons = self
                .retry_reasons
                .iter()
                .map(|reason| Value::from(reason.as_str()))
                .collect();
            out.insert("retryReasons".into(), Value::Array(reasons));
        }
    }
}

/// Name and description the server's error map attached to a status code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMapInfo {
    pub name: String,
    pub description: String,
}

/// Enhanced error reference/context strings supplied by the data service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedErrorInfo {
    pub reference: String,
    pub context: String,
}

/// One HTTP round trip against a cluster service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpExchange {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub body: String,
    pub hostname: String,
    pub port: u16,
}

impl HttpExchange {
    fn render_into(&self, out: &mut Map<String, Value>) {
        out.insert("method".into(), Value::from(self.method.as_str()));
        out.insert("path".into(), Value::from(self.path.as_str()));
        out.insert("httpStatus".into(), Value::from(self.status));
        out.insert("httpBody".into(), Value::from(self.body.as_str()));
        if !self.hostname.is_empty() {
            out.insert("hostname".into(), Value::from(self.hostname.as_str()));
            out.insert("port".into(), Value::from(self.port));
        }
    }
}

/// First error reported in a query-like response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstError {
    pub code: u64,
    pub message: String,
}

/// Raw failure report the cluster core attaches to an unsuccessful response.
///
/// Fields that do not apply to the failed request are left empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFailure {
    pub code: ErrorCode,
    pub message: Option<String>,
    pub retry: RetryInfo,
    pub opaque: Option<u32>,
    pub cas: Option<u64>,
    pub status_code: Option<u16>,
    pub error_map: Option<ErrorMapInfo>,
    pub extended: Option<ExtendedErrorInfo>,
    pub http: Option<HttpExchange>,
    pub first_error: Option<FirstError>,
    pub client_context_id: Option<String>,
}

impl ServiceFailure {
    pub fn new(code: impl Into<ErrorCode>) -> Self {
        ServiceFailure {
            code: code.into(),
            message: None,
            retry: RetryInfo::default(),
            opaque: None,
            cas: None,
            status_code: None,
            error_map: None,
            extended: None,
            http: None,
            first_error: None,
            client_context_id: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_http(mut self, http: HttpExchange) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_first_error(mut self, code: u64, message: impl Into<String>) -> Self {
        self.first_error = Some(FirstError {
            code,
            message: message.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyValueErrorContext {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub id: String,
    pub opaque: u32,
    pub cas: u64,
    pub status_code: Option<u16>,
    pub error_map: Option<ErrorMapInfo>,
    pub extended: Option<ExtendedErrorInfo>,
    pub retry: RetryInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryErrorContext {
    pub first_error_code: u64,
    pub first_error_message: String,
    pub client_context_id: String,
    pub statement: String,
    pub parameters: Option<String>,
    pub http: HttpExchange,
    pub retry: RetryInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsErrorContext {
    pub first_error_code: u64,
    pub first_error_message: String,
    pub client_context_id: String,
    pub statement: String,
    pub parameters: Option<String>,
    pub http: HttpExchange,
    pub retry: RetryInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewErrorContext {
    pub design_document_name: String,
    pub view_name: String,
    pub query_string: Vec<String>,
    pub client_context_id: String,
    pub http: HttpExchange,
    pub retry: RetryInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchErrorContext {
    pub index_name: String,
    pub query: String,
    pub parameters: Option<String>,
    pub client_context_id: String,
    pub http: HttpExchange,
    pub retry: RetryInfo,
}

/// Context of a management (REST) request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorContext {
    pub client_context_id: String,
    pub http: HttpExchange,
    pub retry: RetryInfo,
}

/// Which terminal state a failed transaction reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionFailureType {
    Fail,
    Expiry,
    CommitAmbiguous,
}

impl TransactionFailureType {
    pub const fn as_str(self) -> &'static str {
        match self {
            TransactionFailureType::Fail => "fail",
            TransactionFailureType::Expiry => "expiry",
            TransactionFailureType::CommitAmbiguous => "commit_ambiguous",
        }
    }
}

/// Outcome of a finished transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub unstaging_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionErrorContext {
    pub cause: Option<String>,
    pub failure_type: Option<TransactionFailureType>,
    pub result: Option<TransactionResult>,
    pub should_not_retry: bool,
    pub should_not_rollback: bool,
}

/// Structured diagnostics attached to exactly one failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    #[default]
    Empty,
    KeyValue(KeyValueErrorContext),
    Query(QueryErrorContext),
    Analytics(AnalyticsErrorContext),
    View(ViewErrorContext),
    Search(SearchErrorContext),
    Http(HttpErrorContext),
    Transaction(TransactionErrorContext),
}

impl ErrorContext {
    /// Builds a key-value context for a failed request on `id`.
    pub fn key_value(id: &DocumentId, failure: &ServiceFailure) -> Self {
        ErrorContext::KeyValue(KeyValueErrorContext {
            bucket: id.bucket.clone(),
            scope: id.scope.clone(),
            collection: id.collection.clone(),
            id: id.key.clone(),
            opaque: failure.opaque.unwrap_or_default(),
            cas: failure.cas.unwrap_or_default(),
            status_code: failure.status_code,
            error_map: failure.error_map.clone(),
            extended: failure.extended.clone(),
            retry: failure.retry.clone(),
        })
    }

    pub fn query(statement: &str, parameters: Option<String>, failure: &ServiceFailure) -> Self {
        let first = failure.first_error.clone().unwrap_or_default();
        ErrorContext::Query(QueryErrorContext {
            first_error_code: first.code,
            first_error_message: first.message,
            client_context_id: failure.client_context_id.clone().unwrap_or_default(),
            statement: statement.to_string(),
            parameters,
            http: failure.http.clone().unwrap_or_default(),
            retry: failure.retry.clone(),
        })
    }

    pub fn analytics(statement: &str, parameters: Option<String>, failure: &ServiceFailure) -> Self {
        let first = failure.first_error.clone().unwrap_or_default();
        ErrorContext::Analytics(AnalyticsErrorContext {
            first_error_code: first.code,
            first_error_message: first.message,
            client_context_id: failure.client_context_id.clone().unwrap_or_default(),
            statement: statement.to_string(),
            parameters,
            http: failure.http.clone().unwrap_or_default(),
            retry: failure.retry.clone(),
        })
    }

    pub fn search(
        index_name: &str,
        query: &str,
        parameters: Option<String>,
        failure: &ServiceFailure,
    ) -> Self {
        ErrorContext::Search(SearchErrorContext {
            index_name: index_name.to_string(),
            query: query.to_string(),
            parameters,
            client_context_id: failure.client_context_id.clone().unwrap_or_default(),
            http: failure.http.clone().unwrap_or_default(),
            retry: failure.retry.clone(),
        })
    }

    pub fn view(
        design_document_name: &str,
        view_name: &str,
        query_string: Vec<String>,
        failure: &ServiceFailure,
    ) -> Self {
        ErrorContext::View(ViewErrorContext {
            design_document_name: design_document_name.to_string(),
            view_name: view_name.to_string(),
            query_string,
            client_context_id: failure.client_context_id.clone().unwrap_or_default(),
            http: failure.http.clone().unwrap_or_default(),
            retry: failure.retry.clone(),
        })
    }

    pub fn http(failure: &ServiceFailure) -> Self {
        ErrorContext::Http(HttpErrorContext {
            client_context_id: failure.client_context_id.clone().unwrap_or_default(),
            http: failure.http.clone().unwrap_or_default(),
            retry: failure.retry.clone(),
        })
    }

    pub fn transaction(context: TransactionErrorContext) -> Self {
        ErrorContext::Transaction(context)
    }

    /// Short variant name, also rendered as the `type` field.
    pub const fn kind(&self) -> &'static str {
        match self {
            ErrorContext::Empty => "empty",
            ErrorContext::KeyValue(_) => "key_value",
            ErrorContext::Query(_) => "query",
            ErrorContext::Analytics(_) => "analytics",
            ErrorContext::View(_) => "view",
            ErrorContext::Search(_) => "search",
            ErrorContext::Http(_) => "http",
            ErrorContext::Transaction(_) => "transaction",
        }
    }

    /// Retry diagnostics, absent for the empty and transaction variants.
    pub fn retry(&self) -> Option<&RetryInfo> {
        match self {
            ErrorContext::Empty | ErrorContext::Transaction(_) => None,
            ErrorContext::KeyValue(ctx) => Some(&ctx.retry),
            ErrorContext::Query(ctx) => Some(&ctx.retry),
            ErrorContext::Analytics(ctx) => Some(&ctx.retry),
            ErrorContext::View(ctx) => Some(&ctx.retry),
            ErrorContext::Search(ctx) => Some(&ctx.retry),
            ErrorContext::Http(ctx) => Some(&ctx.retry),
        }
    }

    /// Renders the context into host-visible fields.
    ///
    /// **Logic**:
    /// 1. Emit the variant's own fields.
    /// 2. Append the shared retry suffix when the variant has one.
    pub fn render(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("type".into(), Value::from(self.kind()));
        match self {
            ErrorContext::Empty => {}
            ErrorContext::KeyValue(ctx) => {
                out.insert("bucketName".into(), Value::from(ctx.bucket.as_str()));
                out.insert("scopeName".into(), Value::from(ctx.scope.as_str()));
                out.insert("collectionName".into(), Value::from(ctx.collection.as_str()));
                out.insert("id".into(), Value::from(ctx.id.as_str()));
                out.insert("opaque".into(), Value::from(ctx.opaque));
                out.insert("cas".into(), Value::from(ctx.cas));
                if let Some(status) = ctx.status_code {
                    out.insert("statusCode".into(), Value::from(status));
                }
                if let Some(info) = &ctx.error_map {
                    let mut map = Map::new();
                    map.insert("name".into(), Value::from(info.name.as_str()));
                    map.insert("description".into(), Value::from(info.description.as_str()));
                    out.insert("errorMapInfo".into(), Value::Object(map));
                }
                if let Some(info) = &ctx.extended {
                    let mut map = Map::new();
                    map.insert("reference".into(), Value::from(info.reference.as_str()));
                    map.insert("context".into(), Value::from(info.context.as_str()));
                    out.insert("extendedErrorInfo".into(), Value::Object(map));
                }
            }
            ErrorContext::Query(ctx) => {
                out.insert("firstErrorCode".into(), Value::from(ctx.first_error_code));
                out.insert(
                    "firstErrorMessage".into(),
                    Value::from(ctx.first_error_message.as_str()),
                );
                out.insert(
                    "clientContextId".into(),
                    Value::from(ctx.client_context_id.as_str()),
                );
                out.insert("statement".into(), Value::from(ctx.statement.as_str()));
                if let Some(parameters) = &ctx.parameters {
                    out.insert("parameters".into(), Value::from(parameters.as_str()));
                }
                ctx.http.render_into(&mut out);
            }
            ErrorContext::Analytics(ctx) => {
                out.insert("firstErrorCode".into(), Value::from(ctx.first_error_code));
                out.insert(
                    "firstErrorMessage".into(),
                    Value::from(ctx.first_error_message.as_str()),
                );
                out.insert(
                    "clientContextId".into(),
                    Value::from(ctx.client_context_id.as_str()),
                );
                out.insert("statement".into(), Value::from(ctx.statement.as_str()));
                if let Some(parameters) = &ctx.parameters {
                    out.insert("parameters".into(), Value::from(parameters.as_str()));
                }
                ctx.http.render_into(&mut out);
            }
            ErrorContext::View(ctx) => {
                out.insert(
                    "designDocumentName".into(),
                    Value::from(ctx.design_document_name.as_str()),
                );
                out.insert("viewName".into(), Value::from(ctx.view_name.as_str()));
                let query_string = ctx
                    .query_string
                    .iter()
                    .map(|item| Value::from(item.as_str()))
                    .collect();
                out.insert("queryString".into(), Value::Array(query_string));
                out.insert(
                    "clientContextId".into(),
                    Value::from(ctx.client_context_id.as_str()),
                );
                ctx.http.render_into(&mut out);
            }
            ErrorContext::Search(ctx) => {
                out.insert("indexName".into(), Value::from(ctx.index_name.as_str()));
                out.insert("query".into(), Value::from(ctx.query.as_str()));
                if let Some(parameters) = &ctx.parameters {
                    out.insert("parameters".into(), Value::from(parameters.as_str()));
                }
                out.insert(
                    "clientContextId".into(),
                    Value::from(ctx.client_context_id.as_str()),
                );
                ctx.http.render_into(&mut out);
            }
            ErrorContext::Http(ctx) => {
                out.insert(
                    "clientContextId".into(),
                    Value::from(ctx.client_context_id.as_str()),
                );
                ctx.http.render_into(&mut out);
            }
            ErrorContext::Transaction(ctx) => {
                if let Some(cause) = &ctx.cause {
                    out.insert("cause".into(), Value::from(cause.as_str()));
                }
                if let Some(kind) = ctx.failure_type {
                    out.insert("failureType".into(), Value::from(kind.as_str()));
                }
                if let Some(result) = &ctx.result {
                    let mut map = Map::new();
                    map.insert(
                        "transactionId".into(),
                        Value::from(result.transaction_id.as_str()),
                    );
                    map.insert(
                        "unstagingComplete".into(),
                        Value::from(result.unstaging_complete),
                    );
                    out.insert("result".into(), Value::Object(map));
                }
                out.insert("shouldNotRetry".into(), Value::from(ctx.should_not_retry));
                out.insert("shouldNotRollback".into(), Value::from(ctx.should_not_rollback));
            }
        }
        if let Some(retry) = self.retry() {
            retry.render_into(&mut out);
        }
        out
    }

    /// Category-specific text appended to the base exception message.
    pub fn enhanced_message(&self) -> Option<String> {
        match self {
            ErrorContext::KeyValue(ctx) => {
                let info = ctx.extended.as_ref()?;
                let mut parts = Vec::with_capacity(2);
                if !info.reference.is_empty() {
                    parts.push(format!("ref=\"{}\"", info.reference));
                }
                if !info.context.is_empty() {
                    parts.push(format!("context=\"{}\"", info.context));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(", "))
                }
            }
            ErrorContext::Query(ctx) => {
                server_error(ctx.first_error_code, &ctx.first_error_message)
            }
            ErrorContext::Analytics(ctx) => {
                server_error(ctx.first_error_code, &ctx.first_error_message)
            }
            _ => None,
        }
    }
}

fn server_error(code: u64, message: &str) -> Option<String> {
    if code == 0 && message.is_empty() {
        return None;
    }
    Some(format!("serverError={}, \"{}\"", code, message))
}
