//! # Loopback Cluster
//!
//! Purpose: An in-process implementation of the cluster-core interface. Each
//! `LoopbackCore` owns a tokio event loop; requests are spawned onto it and
//! answered from shared cluster state (document store, management metadata,
//! scripted query/analytics/search/view responders).
//!
//! ## Design Principles
//! 1. **Same Contract As A Network Core**: Nothing is answered unless some
//!    thread drives the core's loop, validation failures are returned
//!    synchronously, and everything else arrives through the completion.
//! 2. **Shared Cluster, Private Handles**: `LoopbackCluster` is the cluster;
//!    every `create` hands out a new handle with its own loop and open-bucket
//!    set, the way separate client connections would see one cluster.
//! 3. **Scriptable**: Latency, one-shot failures, abandoned completions and
//!    stalled closes can be injected so callers can exercise their timeout
//!    and error paths.
//!
//! ## Structure Overview
//!
//! ```text
//! LoopbackCluster ── Arc<ClusterState> ──┬── DocumentStore
//!        │ create()                     ├── RwLock<Metadata>
//!        ▼                              └── injections, responders, fork log
//! LoopbackCore ── Arc<CoreShared> ── TrackedIo(RuntimeIoContext)
//! ```

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use csm_common::{
    CommonErrc, CoreErrorInfo, CoreResult, DocumentId, ErrorCode, ErrorMapInfo,
    ExtendedErrorInfo, ForkEvent, HttpExchange, KeyValueErrc, ServiceFailure,
};

use crate::completion::Completion;
use crate::core::{
    ClusterCore, ClusterCoreFactory, IoContext, TransactionFailure, TransactionOpFailure,
    Transactions, TransactionsConfig,
};
use crate::io::RuntimeIoContext;
use crate::management::{self, Metadata};
use crate::request::{
    AnalyticsRequest, BucketSettings, ConnectionTarget, Credentials, EndpointReport,
    ManagementRequest, MutationResult, MutationToken, Outcome, QueryMeta, QueryRequest,
    QueryResult, Request, Response, SearchRequest, SearchResult, ServiceReport, ServiceType,
    Timeouts, ViewRequest, ViewResult,
};
use crate::store::{DocumentStore, Write};
use crate::txn::LoopbackTransactions;

/// Longest document key the data service accepts.
pub const MAX_KEY_LENGTH: usize = 250;

const SDK_NAME: &str = concat!("csm-loopback/", env!("CARGO_PKG_VERSION"));

pub type QueryResponder = Arc<dyn Fn(&QueryRequest) -> Outcome<QueryResult> + Send + Sync>;
pub type AnalyticsResponder = Arc<dyn Fn(&AnalyticsRequest) -> Outcome<QueryResult> + Send + Sync>;
pub type SearchResponder = Arc<dyn Fn(&SearchRequest) -> Outcome<SearchResult> + Send + Sync>;
pub type ViewResponder = Arc<dyn Fn(&ViewRequest) -> Outcome<ViewResult> + Send + Sync>;

/// Port a service listens on, used in endpoint strings and HTTP contexts.
pub fn service_port(service: ServiceType) -> u16 {
    match service {
        ServiceType::KeyValue => 11210,
        ServiceType::Query => 8093,
        ServiceType::Analytics => 8095,
        ServiceType::Search => 8094,
        ServiceType::View => 8092,
        ServiceType::Management => 8091,
    }
}

fn remote_endpoint(service: ServiceType) -> String {
    format!("127.0.0.1:{}", service_port(service))
}

/// Component that observed a fork phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkComponent {
    Io,
    Transactions,
}

/// One fork notification, in the order the cluster observed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkRecord {
    pub core: u64,
    pub component: ForkComponent,
    pub event: ForkEvent,
}

/// Counters of one handle handed out by `LoopbackCluster::create`.
#[derive(Debug)]
pub struct CoreStats {
    id: u64,
    loop_runs: AtomicUsize,
    open: AtomicBool,
    closes: AtomicUsize,
}

impl CoreStats {
    fn new(id: u64) -> Self {
        CoreStats {
            id,
            loop_runs: AtomicUsize::new(0),
            open: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// How many times a thread entered the handle's event loop.
    pub fn loop_runs(&self) -> usize {
        self.loop_runs.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Completed graceful closes.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }
}

enum Injection {
    Fail(ServiceFailure),
    Abandon,
}

#[derive(Default)]
struct Responders {
    query: Option<QueryResponder>,
    analytics: Option<AnalyticsResponder>,
    search: Option<SearchResponder>,
    view: Option<ViewResponder>,
}

pub(crate) struct ClusterState {
    pub(crate) store: DocumentStore,
    meta: RwLock<Metadata>,
    credentials: RwLock<Credentials>,
    latency: Mutex<HashMap<ServiceType, Duration>>,
    injections: Mutex<HashMap<ServiceType, VecDeque<Injection>>>,
    responders: RwLock<Responders>,
    txn_failures: Mutex<VecDeque<TransactionOpFailure>>,
    commit_failures: Mutex<VecDeque<TransactionFailure>>,
    stall_close: AtomicBool,
    stalled: Mutex<Vec<Completion<()>>>,
    loop_exit_delay: Mutex<Duration>,
    cores: Mutex<Vec<Arc<CoreStats>>>,
    next_core: AtomicU64,
    next_opaque: AtomicU32,
    next_request: AtomicU64,
    fork_log: Mutex<Vec<ForkRecord>>,
}

impl ClusterState {
    fn new() -> Self {
        ClusterState {
            store: DocumentStore::new(),
            meta: RwLock::new(Metadata::default()),
            credentials: RwLock::new(Credentials {
                username: "Administrator".to_string(),
                password: "password".to_string(),
            }),
            latency: Mutex::new(HashMap::new()),
            injections: Mutex::new(HashMap::new()),
            responders: RwLock::new(Responders::default()),
            txn_failures: Mutex::new(VecDeque::new()),
            commit_failures: Mutex::new(VecDeque::new()),
            stall_close: AtomicBool::new(false),
            stalled: Mutex::new(Vec::new()),
            loop_exit_delay: Mutex::new(Duration::ZERO),
            cores: Mutex::new(Vec::new()),
            next_core: AtomicU64::new(1),
            next_opaque: AtomicU32::new(1),
            next_request: AtomicU64::new(1),
            fork_log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn record_fork(&self, core: u64, component: ForkComponent, event: ForkEvent) {
        self.fork_log.lock().push(ForkRecord {
            core,
            component,
            event,
        });
    }

    pub(crate) fn take_txn_failure(&self) -> Option<TransactionOpFailure> {
        self.txn_failures.lock().pop_front()
    }

    pub(crate) fn take_commit_failure(&self) -> Option<TransactionFailure> {
        self.commit_failures.lock().pop_front()
    }

    /// Replica count of `bucket`, `None` when it does not exist.
    pub(crate) fn bucket_replicas(&self, bucket: &str) -> Option<u32> {
        self.meta.read().bucket(bucket).map(|b| b.settings.num_replicas)
    }

    pub(crate) fn latency(&self, service: ServiceType) -> Duration {
        self.latency.lock().get(&service).copied().unwrap_or_default()
    }

    fn take_injection(&self, service: ServiceType) -> Option<Injection> {
        self.injections
            .lock()
            .get_mut(&service)
            .and_then(|queue| queue.pop_front())
    }

    fn next_request_id(&self) -> String {
        format!(
            "{:08x}-0000-4000-8000-{:012x}",
            std::process::id(),
            self.next_request.fetch_add(1, Ordering::Relaxed)
        )
    }

    pub(crate) fn run_query(&self, request: &QueryRequest) -> Outcome<QueryResult> {
        let responder = self.responders.read().query.clone();
        let mut outcome = match responder {
            Some(responder) => responder(request),
            None => Ok(QueryResult::default()),
        };
        if let Ok(result) = &mut outcome {
            self.fill_meta(&mut result.meta, result.rows.len(), &request.client_context_id);
        }
        outcome.map_err(|failure| {
            decorate_http(failure, ServiceType::Query, "POST", "/query/service", &request.client_context_id)
        })
    }

    fn run_analytics(&self, request: &AnalyticsRequest) -> Outcome<QueryResult> {
        let responder = self.responders.read().analytics.clone();
        let mut outcome = match responder {
            Some(responder) => responder(request),
            None => Ok(QueryResult::default()),
        };
        if let Ok(result) = &mut outcome {
            self.fill_meta(&mut result.meta, result.rows.len(), &request.client_context_id);
        }
        outcome.map_err(|failure| {
            decorate_http(
                failure,
                ServiceType::Analytics,
                "POST",
                "/analytics/service",
                &request.client_context_id,
            )
        })
    }

    fn fill_meta(&self, meta: &mut QueryMeta, rows: usize, client_context_id: &Option<String>) {
        if meta.request_id.is_empty() {
            meta.request_id = self.next_request_id();
        }
        if meta.client_context_id.is_empty() {
            meta.client_context_id = client_context_id.clone().unwrap_or_default();
        }
        if meta.status.is_empty() {
            meta.status = "success".to_string();
        }
        meta.result_count = rows as u64;
    }
}

/// The loopback cluster; a factory of `LoopbackCore` handles.
#[derive(Clone)]
pub struct LoopbackCluster {
    state: Arc<ClusterState>,
}

impl LoopbackCluster {
    /// Creates an empty cluster with the `Administrator`/`password` login.
    pub fn new() -> Self {
        LoopbackCluster {
            state: Arc::new(ClusterState::new()),
        }
    }

    /// Adds a bucket (with flush enabled) and returns the cluster.
    pub fn with_bucket(self, name: &str) -> Self {
        let mut settings = BucketSettings::new(name);
        settings.flush_enabled = true;
        self.add_bucket(settings);
        self
    }

    pub fn add_bucket(&self, settings: BucketSettings) {
        self.state.meta.write().add_bucket(settings);
    }

    pub fn set_credentials(&self, username: &str, password: &str) {
        *self.state.credentials.write() = Credentials {
            username: username.to_string(),
            password: password.to_string(),
        };
    }

    /// Delays every request to `service` by `latency`.
    pub fn set_latency(&self, service: ServiceType, latency: Duration) {
        self.state.latency.lock().insert(service, latency);
    }

    /// Makes the next request to `service` fail with `failure`.
    pub fn fail_next(&self, service: ServiceType, failure: ServiceFailure) {
        self.push_injection(service, Injection::Fail(failure));
    }

    /// Makes the next request to `service` drop its completion unresolved.
    pub fn abandon_next(&self, service: ServiceType) {
        self.push_injection(service, Injection::Abandon);
    }

    /// Makes the next transaction step fail.
    pub fn fail_next_transaction_op(&self, failure: TransactionOpFailure) {
        self.state.txn_failures.lock().push_back(failure);
    }

    /// Makes the next transaction commit fail.
    pub fn fail_next_commit(&self, failure: TransactionFailure) {
        self.state.commit_failures.lock().push_back(failure);
    }

    /// When set, graceful closes never complete.
    pub fn stall_close(&self, stall: bool) {
        self.state.stall_close.store(stall, Ordering::Release);
    }

    /// Keeps every loop thread busy for `delay` after it is told to stop.
    pub fn set_loop_exit_delay(&self, delay: Duration) {
        *self.state.loop_exit_delay.lock() = delay;
    }

    pub fn on_query<F>(&self, responder: F)
    where
        F: Fn(&QueryRequest) -> Outcome<QueryResult> + Send + Sync + 'static,
    {
        self.state.responders.write().query = Some(Arc::new(responder));
    }

    pub fn on_analytics<F>(&self, responder: F)
    where
        F: Fn(&AnalyticsRequest) -> Outcome<QueryResult> + Send + Sync + 'static,
    {
        self.state.responders.write().analytics = Some(Arc::new(responder));
    }

    pub fn on_search<F>(&self, responder: F)
    where
        F: Fn(&SearchRequest) -> Outcome<SearchResult> + Send + Sync + 'static,
    {
        self.state.responders.write().search = Some(Arc::new(responder));
    }

    pub fn on_view<F>(&self, responder: F)
    where
        F: Fn(&ViewRequest) -> Outcome<ViewResult> + Send + Sync + 'static,
    {
        self.state.responders.write().view = Some(Arc::new(responder));
    }

    /// Stats of every handle created so far, oldest first.
    pub fn cores(&self) -> Vec<Arc<CoreStats>> {
        self.state.cores.lock().clone()
    }

    /// Handles that are currently open.
    pub fn open_cores(&self) -> usize {
        self.state.cores.lock().iter().filter(|core| core.is_open()).count()
    }

    pub fn fork_log(&self) -> Vec<ForkRecord> {
        self.state.fork_log.lock().clone()
    }

    pub fn document_count(&self) -> usize {
        self.state.store.len()
    }

    fn push_injection(&self, service: ServiceType, injection: Injection) {
        self.state
            .injections
            .lock()
            .entry(service)
            .or_default()
            .push_back(injection);
    }
}

impl Default for LoopbackCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterCoreFactory for LoopbackCluster {
    fn create(&self) -> CoreResult<Arc<dyn ClusterCore>> {
        let core = LoopbackCore::new(Arc::clone(&self.state))?;
        Ok(Arc::new(core))
    }
}

/// Event loop wrapper that reports loop entries and fork phases.
pub struct TrackedIo {
    inner: RuntimeIoContext,
    stats: Arc<CoreStats>,
    state: Arc<ClusterState>,
}

impl TrackedIo {
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.spawn(task);
    }
}

impl IoContext for TrackedIo {
    fn run(&self) {
        self.stats.loop_runs.fetch_add(1, Ordering::AcqRel);
        self.inner.run();
        let delay = *self.state.loop_exit_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn restart(&self) {
        self.inner.restart();
    }

    fn notify_fork(&self, event: ForkEvent) {
        self.state.record_fork(self.stats.id, ForkComponent::Io, event);
        self.inner.notify_fork(event);
    }
}

#[derive(Default)]
struct Connection {
    target: Option<ConnectionTarget>,
    buckets: HashSet<String>,
}

pub(crate) struct CoreShared {
    pub(crate) stats: Arc<CoreStats>,
    pub(crate) state: Arc<ClusterState>,
    pub(crate) io: Arc<TrackedIo>,
    connection: Mutex<Connection>,
}

/// One client handle onto the loopback cluster.
pub struct LoopbackCore {
    shared: Arc<CoreShared>,
}

impl LoopbackCore {
    fn new(state: Arc<ClusterState>) -> CoreResult<Self> {
        let id = state.next_core.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(CoreStats::new(id));
        let inner = RuntimeIoContext::new().map_err(|err| {
            CoreErrorInfo::new(
                CommonErrc::InternalServerFailure,
                format!("unable to create event loop: {}", err),
            )
        })?;
        state.cores.lock().push(Arc::clone(&stats));
        let io = Arc::new(TrackedIo {
            inner,
            stats: Arc::clone(&stats),
            state: Arc::clone(&state),
        });
        Ok(LoopbackCore {
            shared: Arc::new(CoreShared {
                stats,
                state,
                io,
                connection: Mutex::new(Connection::default()),
            }),
        })
    }

    pub fn stats(&self) -> Arc<CoreStats> {
        Arc::clone(&self.shared.stats)
    }
}

impl ClusterCore for LoopbackCore {
    fn io(&self) -> Arc<dyn IoContext> {
        self.shared.io.clone()
    }

    fn open(&self, target: &ConnectionTarget, done: Completion<Outcome<()>>) -> CoreResult<()> {
        validate_connection_string(&target.connection_string)?;

        let shared = Arc::clone(&self.shared);
        let target = target.clone();
        self.shared.io.spawn(async move {
            let latency = shared.state.latency(ServiceType::KeyValue);
            if latency >= target.timeouts.connect {
                tokio::time::sleep(target.timeouts.connect).await;
                done.complete(Err(ServiceFailure::new(CommonErrc::UnambiguousTimeout)
                    .with_message("timed out while bootstrapping")));
                return;
            }
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let accepted = *shared.state.credentials.read() == target.credentials;
            if !accepted {
                tracing::debug!(core = shared.stats.id, "loopback rejected credentials");
                done.complete(Err(ServiceFailure::new(CommonErrc::AuthenticationFailure)
                    .with_message("invalid username or password")));
                return;
            }

            shared.connection.lock().target = Some(target);
            shared.stats.open.store(true, Ordering::Release);
            tracing::debug!(core = shared.stats.id, "loopback core open");
            done.complete(Ok(()));
        });
        Ok(())
    }

    fn close(&self, done: Completion<()>) {
        let shared = Arc::clone(&self.shared);
        self.shared.io.spawn(async move {
            {
                let mut connection = shared.connection.lock();
                connection.target = None;
                connection.buckets.clear();
            }
            shared.stats.open.store(false, Ordering::Release);
            if shared.state.stall_close.load(Ordering::Acquire) {
                shared.state.stalled.lock().push(done);
                return;
            }
            shared.stats.closes.fetch_add(1, Ordering::AcqRel);
            done.complete(());
        });
    }

    fn execute(&self, request: Request, done: Completion<Outcome<Response>>) -> CoreResult<()> {
        validate_request(&request)?;

        let service = request.service();
        let timeout = request
            .timeout()
            .unwrap_or_else(|| self.shared.default_timeout(service));
        let injection = self.shared.state.take_injection(service);
        let shared = Arc::clone(&self.shared);
        self.shared.io.spawn(async move {
            if let Some(Injection::Abandon) = injection {
                drop(done);
                return;
            }

            let latency = shared.state.latency(service);
            if latency >= timeout {
                tokio::time::sleep(timeout).await;
                done.complete(Err(shared.timeout_failure(&request, timeout)));
                return;
            }
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let outcome = match injection {
                Some(Injection::Fail(failure)) => Err(shared.decorate(&request, failure)),
                _ => shared.handle(request),
            };
            done.complete(outcome);
        });
        Ok(())
    }

    fn transactions(
        &self,
        config: TransactionsConfig,
        done: Completion<Outcome<Arc<dyn Transactions>>>,
    ) -> CoreResult<()> {
        if config.timeout.is_zero() {
            return Err(CoreErrorInfo::invalid_argument(
                "transaction timeout must be positive",
            ));
        }
        let shared = Arc::clone(&self.shared);
        self.shared.io.spawn(async move {
            if !shared.stats.is_open() {
                done.complete(Err(not_open()));
                return;
            }
            let transactions: Arc<dyn Transactions> =
                Arc::new(LoopbackTransactions::new(Arc::clone(&shared), config));
            done.complete(Ok(transactions));
        });
        Ok(())
    }
}

impl CoreShared {
    fn default_timeout(&self, service: ServiceType) -> Duration {
        let connection = self.connection.lock();
        let defaults = Timeouts::default();
        let timeouts = connection
            .target
            .as_ref()
            .map(|target| &target.timeouts)
            .unwrap_or(&defaults);
        match service {
            ServiceType::KeyValue => timeouts.key_value,
            ServiceType::Query => timeouts.query,
            ServiceType::Analytics => timeouts.analytics,
            ServiceType::Search => timeouts.search,
            ServiceType::View => timeouts.view,
            ServiceType::Management => timeouts.management,
        }
    }

    fn timeout_failure(&self, request: &Request, timeout: Duration) -> ServiceFailure {
        let code = if request.is_mutation() {
            CommonErrc::AmbiguousTimeout
        } else {
            CommonErrc::UnambiguousTimeout
        };
        let failure = ServiceFailure::new(code)
            .with_message(format!("no response within {}ms", timeout.as_millis()));
        self.decorate(request, failure)
    }

    /// Fills in the dispatch details a failure from `request` would carry.
    fn decorate(&self, request: &Request, mut failure: ServiceFailure) -> ServiceFailure {
        let service = request.service();
        if failure.retry.last_dispatched_to.is_none() {
            failure.retry.last_dispatched_to = Some(remote_endpoint(service));
            failure.retry.last_dispatched_from = Some(format!("127.0.0.1:{}", 50_000 + self.stats.id));
        }
        match request {
            Request::Query(req) => {
                decorate_http(failure, service, "POST", "/query/service", &req.client_context_id)
            }
            Request::Analytics(req) => {
                decorate_http(failure, service, "POST", "/analytics/service", &req.client_context_id)
            }
            Request::Search(req) => decorate_http(
                failure,
                service,
                "POST",
                &format!("/api/index/{}/query", req.index_name),
                &req.client_context_id,
            ),
            Request::View(req) => decorate_http(
                failure,
                service,
                "GET",
                &format!("/{}/_design/{}/_view/{}", req.bucket, req.design_document, req.view),
                &req.client_context_id,
            ),
            Request::Management(_) => decorate_http(failure, service, "GET", "/pools", &None),
            _ => {
                if failure.opaque.is_none() {
                    failure.opaque = Some(self.state.next_opaque.fetch_add(1, Ordering::Relaxed));
                }
                failure
            }
        }
    }

    /// Answers one request from cluster state.
    fn handle(&self, request: Request) -> Outcome<Response> {
        if !self.stats.is_open() {
            return Err(self.decorate(&request, not_open()));
        }
        let now = Instant::now();
        let result = match &request {
            Request::OpenBucket { bucket } => {
                if self.state.meta.read().bucket(bucket).is_none() {
                    Err(ServiceFailure::new(CommonErrc::BucketNotFound)
                        .with_message(format!("bucket \"{}\" does not exist", bucket)))
                } else {
                    self.connection.lock().buckets.insert(bucket.clone());
                    Ok(Response::Empty)
                }
            }
            Request::CloseBucket { bucket } => {
                self.connection.lock().buckets.remove(bucket);
                Ok(Response::Empty)
            }
            Request::Get { id, .. } => self
                .check_keyspace(id)
                .and_then(|_| {
                    self.state
                        .store
                        .get(id, now)
                        .map_err(|code| self.kv_failure(code, id))
                })
                .map(Response::Get),
            Request::Mutate {
                kind,
                id,
                value,
                options,
            } => self.check_keyspace(id).and_then(|max_expiry| {
                self.check_durability(id, options.durability.required_replicas())?;
                let write = Write {
                    kind: *kind,
                    value: value.clone(),
                    flags: options.flags,
                    expiry: cap_expiry(options.expiry, max_expiry),
                    cas: options.cas,
                };
                self.state
                    .store
                    .write(id, write, now)
                    .map(|stored| Response::Mutation(self.mutation_result(id, stored)))
                    .map_err(|code| self.kv_failure(code, id))
            }),
            Request::Remove { id, options } => self.check_keyspace(id).and_then(|_| {
                self.check_durability(id, options.durability.required_replicas())?;
                self.state
                    .store
                    .remove(id, options.cas, now)
                    .map(|stored| Response::Mutation(self.mutation_result(id, stored)))
                    .map_err(|code| self.kv_failure(code, id))
            }),
            Request::Query(req) => self.state.run_query(req).map(Response::Query),
            Request::Analytics(req) => self.state.run_analytics(req).map(Response::Analytics),
            Request::Search(req) => {
                let responder = self.state.responders.read().search.clone();
                let outcome = match responder {
                    Some(responder) => responder(req),
                    None => Ok(SearchResult::default()),
                };
                outcome.map(Response::Search)
            }
            Request::View(req) => {
                if self.state.meta.read().bucket(&req.bucket).is_none() {
                    Err(ServiceFailure::new(CommonErrc::BucketNotFound))
                } else {
                    let responder = self.state.responders.read().view.clone();
                    let outcome = match responder {
                        Some(responder) => responder(req),
                        None => Err(ServiceFailure::new(csm_common::ViewErrc::DesignDocumentNotFound)
                            .with_message(format!("design document \"{}\" not found", req.design_document))),
                    };
                    outcome.map(Response::View)
                }
            }
            Request::Ping(req) => Ok(Response::Ping(self.report(&req.services, req.report_id.clone(), true))),
            Request::Diagnostics { report_id } => {
                Ok(Response::Diagnostics(self.report(&[], report_id.clone(), false)))
            }
            Request::Management(req) => self.manage(req).map(Response::Management),
        };
        result.map_err(|failure| self.decorate(&request, failure))
    }

    fn manage(&self, request: &ManagementRequest) -> Outcome<crate::request::ManagementResponse> {
        let mut meta = self.state.meta.write();
        let outcome = management::apply(&mut meta, &self.state.store, request);
        if outcome.is_ok() {
            if let ManagementRequest::BucketDrop { name } = request {
                self.connection.lock().buckets.remove(name);
            }
        }
        outcome
    }

    /// Checks bucket, scope and collection; returns the collection's max expiry.
    fn check_keyspace(&self, id: &DocumentId) -> Result<u64, ServiceFailure> {
        if !self.connection.lock().buckets.contains(&id.bucket) {
            return Err(self.kv_failure(CommonErrc::BucketNotFound.into(), id));
        }
        let meta = self.state.meta.read();
        let bucket = meta
            .bucket(&id.bucket)
            .ok_or_else(|| self.kv_failure(CommonErrc::BucketNotFound.into(), id))?;
        let collection = bucket
            .collection(&id.scope, &id.collection)
            .map_err(|code| self.kv_failure(code, id))?;
        Ok(if collection.max_expiry > 0 {
            collection.max_expiry
        } else {
            bucket.settings.max_expiry
        })
    }

    fn check_durability(&self, id: &DocumentId, required: u32) -> Result<(), ServiceFailure> {
        let replicas = self
            .state
            .meta
            .read()
            .bucket(&id.bucket)
            .map(|bucket| bucket.settings.num_replicas)
            .unwrap_or_default();
        if required > replicas {
            return Err(self.kv_failure(KeyValueErrc::DurabilityImpossible.into(), id));
        }
        Ok(())
    }

    fn mutation_result(&self, id: &DocumentId, stored: crate::store::StoredMutation) -> MutationResult {
        let partition_uuid = self
            .state
            .meta
            .read()
            .bucket(&id.bucket)
            .map(|bucket| bucket.uuid)
            .unwrap_or_default();
        MutationResult {
            cas: stored.cas,
            token: Some(MutationToken {
                bucket: id.bucket.clone(),
                partition_id: stored.partition_id,
                partition_uuid,
                sequence_number: stored.sequence_number,
            }),
        }
    }

    /// Builds the failure the data service reports for `code`.
    fn kv_failure(&self, code: ErrorCode, id: &DocumentId) -> ServiceFailure {
        let opaque = self.state.next_opaque.fetch_add(1, Ordering::Relaxed);
        let mut failure = ServiceFailure::new(code);
        failure.opaque = Some(opaque);
        if let Some((status, name, description)) = kv_status(code) {
            failure.status_code = Some(status);
            failure.error_map = Some(ErrorMapInfo {
                name: name.to_string(),
                description: description.to_string(),
            });
        }
        if matches!(
            code,
            ErrorCode::Common(CommonErrc::ScopeNotFound) | ErrorCode::Common(CommonErrc::CollectionNotFound)
        ) {
            failure.extended = Some(ExtendedErrorInfo {
                reference: format!("{:08x}-{:04x}", opaque, self.stats.id),
                context: format!("Unknown collection {}", id.collection_path()),
            });
        }
        failure
    }

    fn report(&self, services: &[ServiceType], report_id: Option<String>, ping: bool) -> ServiceReport {
        let wanted: Vec<ServiceType> = if services.is_empty() {
            ServiceType::ALL.to_vec()
        } else {
            services.to_vec()
        };
        let buckets: Vec<String> = self.connection.lock().buckets.iter().cloned().collect();
        let local = format!("127.0.0.1:{}", 50_000 + self.stats.id);

        let mut report = BTreeMap::new();
        for service in wanted {
            let latency_us = ping.then(|| self.state.latency(service).as_micros().max(1) as u64);
            let state = if ping { "ok" } else { "connected" };
            let endpoints = if service == ServiceType::KeyValue && !buckets.is_empty() {
                buckets
                    .iter()
                    .map(|bucket| EndpointReport {
                        remote: remote_endpoint(service),
                        local: local.clone(),
                        state: state.to_string(),
                        latency_us,
                        namespace: Some(bucket.clone()),
                    })
                    .collect()
            } else {
                vec![EndpointReport {
                    remote: remote_endpoint(service),
                    local: local.clone(),
                    state: state.to_string(),
                    latency_us,
                    namespace: None,
                }]
            };
            report.insert(service, endpoints);
        }

        ServiceReport {
            id: report_id.unwrap_or_else(|| self.state.next_request_id()),
            version: 2,
            sdk: SDK_NAME.to_string(),
            services: report,
        }
    }
}

fn not_open() -> ServiceFailure {
    ServiceFailure::new(CommonErrc::ServiceNotAvailable).with_message("cluster handle is not open")
}

fn cap_expiry(requested: Option<Duration>, max_expiry: u64) -> Option<Duration> {
    if max_expiry == 0 {
        return requested;
    }
    let max = Duration::from_secs(max_expiry);
    Some(requested.map_or(max, |ttl| ttl.min(max)))
}

/// Memcached status, error-map name and description of a data-service code.
fn kv_status(code: ErrorCode) -> Option<(u16, &'static str, &'static str)> {
    match code {
        ErrorCode::KeyValue(KeyValueErrc::DocumentNotFound) => Some((0x01, "KEY_ENOENT", "Not Found")),
        ErrorCode::KeyValue(KeyValueErrc::DocumentExists) | ErrorCode::Common(CommonErrc::CasMismatch) => {
            Some((0x02, "KEY_EEXISTS", "key already exists, or CAS mismatch"))
        }
        ErrorCode::KeyValue(KeyValueErrc::ValueTooLarge) => Some((0x03, "E2BIG", "Value is too big")),
        ErrorCode::KeyValue(KeyValueErrc::DurabilityImpossible) => {
            Some((0xa1, "DURABILITY_IMPOSSIBLE", "The requested durability requirements are impossible"))
        }
        ErrorCode::Common(CommonErrc::ScopeNotFound) | ErrorCode::Common(CommonErrc::CollectionNotFound) => {
            Some((0x88, "UNKNOWN_COLLECTION", "Operation specified an unknown collection"))
        }
        ErrorCode::Common(CommonErrc::BucketNotFound) => {
            Some((0x08, "NO_BUCKET", "Not connected to a bucket"))
        }
        _ => None,
    }
}

/// Fills the HTTP exchange of a failure from an HTTP-based service.
fn decorate_http(
    mut failure: ServiceFailure,
    service: ServiceType,
    method: &str,
    path: &str,
    client_context_id: &Option<String>,
) -> ServiceFailure {
    if failure.client_context_id.is_none() {
        failure.client_context_id = client_context_id.clone();
    }
    if failure.http.is_none() {
        let body = match &failure.first_error {
            Some(first) => serde_json::json!({
                "errors": [{ "code": first.code, "msg": first.message }],
                "status": "fatal",
            })
            .to_string(),
            None => failure.message.clone().unwrap_or_default(),
        };
        failure.http = Some(HttpExchange {
            method: method.to_string(),
            path: path.to_string(),
            status: management::status_for(failure.code),
            body,
            hostname: "127.0.0.1".to_string(),
            port: service_port(service),
        });
    }
    failure
}

fn validate_connection_string(connection_string: &str) -> CoreResult<()> {
    let hosts = connection_string
        .strip_prefix("couchbase://")
        .or_else(|| connection_string.strip_prefix("couchbases://"))
        .ok_or_else(|| {
            CoreErrorInfo::invalid_argument(format!(
                "unable to parse connection string \"{}\"",
                connection_string
            ))
        })?;
    let hosts = hosts.split('?').next().unwrap_or_default();
    if hosts.split(',').all(|host| host.trim().is_empty()) {
        return Err(CoreErrorInfo::invalid_argument(
            "connection string does not list any hosts",
        ));
    }
    Ok(())
}

/// Rejects requests the core would refuse before scheduling any I/O.
fn validate_request(request: &Request) -> CoreResult<()> {
    match request {
        Request::OpenBucket { bucket } | Request::CloseBucket { bucket } if bucket.is_empty() => {
            Err(CoreErrorInfo::invalid_argument("bucket name must not be empty"))
        }
        Request::Get { id, .. } | Request::Mutate { id, .. } | Request::Remove { id, .. } => {
            if id.key.is_empty() {
                Err(CoreErrorInfo::invalid_argument("document id must not be empty"))
            } else if id.key.len() > MAX_KEY_LENGTH {
                Err(CoreErrorInfo::invalid_argument(format!(
                    "document id must not exceed {} bytes",
                    MAX_KEY_LENGTH
                )))
            } else {
                Ok(())
            }
        }
        Request::Query(req) if req.statement.trim().is_empty() => {
            Err(CoreErrorInfo::invalid_argument("statement must not be empty"))
        }
        Request::Analytics(req) if req.statement.trim().is_empty() => {
            Err(CoreErrorInfo::invalid_argument("statement must not be empty"))
        }
        Request::Search(req) if req.index_name.is_empty() => {
            Err(CoreErrorInfo::invalid_argument("search index name must not be empty"))
        }
        Request::View(req) if req.design_document.is_empty() || req.view.is_empty() => Err(
            CoreErrorInfo::invalid_argument("design document and view names must not be empty"),
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_strings_are_validated_synchronously() {
        assert!(validate_connection_string("couchbase://127.0.0.1").is_ok());
        assert!(validate_connection_string("couchbases://a,b?network=external").is_ok());

        let err = validate_connection_string("http://127.0.0.1").unwrap_err();
        assert_eq!(err.code, ErrorCode::Common(CommonErrc::InvalidArgument));
        assert!(validate_connection_string("couchbase://").is_err());
    }

    #[test]
    fn expiry_is_capped_by_collection_limit() {
        assert_eq!(cap_expiry(None, 0), None);
        assert_eq!(cap_expiry(None, 10), Some(Duration::from_secs(10)));
        assert_eq!(
            cap_expiry(Some(Duration::from_secs(60)), 10),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            cap_expiry(Some(Duration::from_secs(5)), 10),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn http_failures_render_first_error_body() {
        let failure = decorate_http(
            ServiceFailure::new(csm_common::QueryErrc::PlanningFailure).with_first_error(4000, "no index"),
            ServiceType::Query,
            "POST",
            "/query/service",
            &Some("ctx-1".to_string()),
        );
        let http = failure.http.unwrap();
        assert_eq!(http.port, 8093);
        assert_eq!(http.status, 400);
        assert!(http.body.contains("no index"));
        assert_eq!(failure.client_context_id.as_deref(), Some("ctx-1"));
    }

    #[test]
    fn oversized_keys_are_rejected_before_dispatch() {
        let request = Request::Get {
            id: DocumentId::in_default_collection("travel", "k".repeat(MAX_KEY_LENGTH + 1)),
            timeout: None,
        };
        let err = validate_request(&request).unwrap_err();
        assert!(err.message.contains("250"));
    }
}
