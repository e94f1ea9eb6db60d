//! # Connection Session
//!
//! Purpose: Own one cluster handle together with the background thread that
//! drives its I/O loop, and expose every cluster operation as a blocking call.
//!
//! ## Design Principles
//! 1. **Thread Iff Open**: A session is only reachable while its I/O thread
//!    runs and the handle is open; a failed `connect` tears both down before
//!    returning. The fork window is the one exception.
//! 2. **Idempotent Stop**: `stop` may be called any number of times; only the
//!    first call closes the handle and joins the thread.
//! 3. **Bounded Teardown**: Closing the handle and joining the thread are both
//!    limited by `SessionSettings`; an overrun is logged, never waited out.
//! 4. **Uniform Failures**: Every failed operation becomes a `CoreErrorInfo`
//!    with `unable to execute <operation> "<name>"` and the matching context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use csm_cluster::{
    ClusterCore, ClusterCoreFactory, ConnectionTarget, IoContext, Request, Response,
};
use csm_common::{
    CommonErrc, CoreErrorInfo, CoreResult, ErrorContext, ForkEvent, ServiceFailure,
    SourceLocation,
};

use crate::bridge::{submit_with, SyncBridge};
use crate::cache::Fingerprint;
use crate::config::SessionSettings;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct Worker {
    io: Arc<dyn IoContext>,
    thread: JoinHandle<()>,
}

/// One open cluster connection and its I/O thread.
pub struct ConnectionSession {
    fingerprint: Fingerprint,
    target: ConnectionTarget,
    core: Arc<dyn ClusterCore>,
    bridge: SyncBridge,
    settings: SessionSettings,
    worker: Mutex<Option<Worker>>,
    open: AtomicBool,
    expiry: Mutex<Instant>,
    thread_starts: AtomicU64,
}

impl ConnectionSession {
    /// Creates a session, starts its I/O thread and opens the connection.
    ///
    /// **Logic**:
    /// 1. Ask the factory for a fresh cluster handle.
    /// 2. Start the I/O thread.
    /// 3. Open the connection through the bridge.
    /// 4. On failure, stop the thread and drop the handle before returning.
    pub fn connect(
        fingerprint: Fingerprint,
        target: ConnectionTarget,
        factory: &dyn ClusterCoreFactory,
        bridge: SyncBridge,
        settings: SessionSettings,
    ) -> CoreResult<Arc<Self>> {
        let core = factory.create()?;
        let session = ConnectionSession {
            fingerprint,
            target,
            core,
            bridge,
            settings,
            worker: Mutex::new(None),
            open: AtomicBool::new(false),
            expiry: Mutex::new(Instant::now()),
            thread_starts: AtomicU64::new(0),
        };
        session.start()?;
        if let Err(err) = session.open() {
            warn!(fingerprint = %session.fingerprint, error = %err, "connection open failed");
            session.stop();
            return Err(err);
        }
        info!(fingerprint = %session.fingerprint, "connection session open");
        Ok(Arc::new(session))
    }

    fn open(&self) -> CoreResult<()> {
        let core = Arc::clone(&self.core);
        let target = self.target.clone();
        let outcome = self
            .bridge
            .call_outcome(submit_with(move |done| core.open(&target, done)))?;
        match outcome {
            Ok(()) => {
                self.open.store(true, Ordering::Release);
                Ok(())
            }
            Err(failure) => Err(CoreErrorInfo {
                code: failure.code,
                location: SourceLocation::caller(),
                message: format!(
                    "unable to connect to \"{}\"",
                    self.target.connection_string
                ),
                context: ErrorContext::http(&failure),
            }),
        }
    }

    /// Spawns the I/O thread. A no-op while one is already running.
    pub fn start(&self) -> CoreResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let io = self.core.io();
        io.restart();
        let runner = Arc::clone(&io);
        let thread = thread::Builder::new()
            .name(format!("csm-io-{}", self.fingerprint.short()))
            .spawn(move || runner.run())
            .map_err(|err| {
                CoreErrorInfo::new(
                    CommonErrc::InternalServerFailure,
                    format!("unable to start I/O thread: {}", err),
                )
            })?;
        *worker = Some(Worker { io, thread });
        self.thread_starts.fetch_add(1, Ordering::AcqRel);
        debug!(fingerprint = %self.fingerprint, "I/O thread started");
        Ok(())
    }

    /// Closes the handle (bounded) and joins the I/O thread (bounded).
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if self.open.swap(false, Ordering::AcqRel) {
            if worker.is_some() {
                self.close_handle();
            } else {
                // Nothing would service the close request.
                warn!(fingerprint = %self.fingerprint, "closing without a running I/O loop");
            }
        }
        if let Some(worker) = worker {
            self.halt(worker);
        }
    }

    fn close_handle(&self) {
        let core = Arc::clone(&self.core);
        let closed = self.bridge.call_within(
            submit_with(move |done| {
                core.close(done);
                Ok(())
            }),
            self.settings.close_timeout,
        );
        match closed {
            Ok(Some(())) => debug!(fingerprint = %self.fingerprint, "cluster handle closed"),
            Ok(None) => warn!(
                fingerprint = %self.fingerprint,
                timeout_ms = self.settings.close_timeout.as_millis() as u64,
                "cluster handle did not close in time"
            ),
            Err(err) => warn!(fingerprint = %self.fingerprint, error = %err, "close failed"),
        }
    }

    fn halt(&self, worker: Worker) {
        worker.io.stop();
        let deadline = Instant::now() + self.settings.join_grace;
        while !worker.thread.is_finished() {
            if Instant::now() >= deadline {
                error!(
                    fingerprint = %self.fingerprint,
                    grace_ms = self.settings.join_grace.as_millis() as u64,
                    "I/O thread did not exit within the join grace period; detaching"
                );
                return;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }
        if worker.thread.join().is_err() {
            error!(fingerprint = %self.fingerprint, "I/O thread panicked");
        } else {
            debug!(fingerprint = %self.fingerprint, "I/O thread joined");
        }
    }

    /// Stops the I/O thread ahead of a fork and tells the loop about it.
    ///
    /// The handle stays open; its sockets are left unserviced.
    pub fn pause_for_fork(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            self.halt(worker);
        }
        self.core.io().notify_fork(ForkEvent::Prepare);
    }

    /// Tells the loop which side of the fork it is on and restarts the thread.
    pub fn resume_after_fork(&self, event: ForkEvent) -> CoreResult<()> {
        self.core.io().notify_fork(event);
        if self.open.load(Ordering::Acquire) {
            self.start()?;
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn core(&self) -> &Arc<dyn ClusterCore> {
        &self.core
    }

    pub(crate) fn bridge(&self) -> &SyncBridge {
        &self.bridge
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Number of times an I/O thread was spawned for this session.
    pub fn thread_starts(&self) -> u64 {
        self.thread_starts.load(Ordering::Acquire)
    }

    pub fn expiry(&self) -> Instant {
        *self.expiry.lock()
    }

    pub fn set_expiry(&self, expiry: Instant) {
        *self.expiry.lock() = expiry;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        *self.expiry.lock() < now
    }

    /// Runs one request through the bridge and maps the outcome.
    ///
    /// **Input**: the request, the operation label and subject name used in
    /// the failure message, a context builder and the response extractor.
    /// **Output**: the extracted value or a `CoreErrorInfo` located at the
    /// caller.
    #[track_caller]
    pub(crate) fn execute<T>(
        &self,
        request: Request,
        operation: &str,
        name: &str,
        context: impl FnOnce(&ServiceFailure) -> ErrorContext,
        extract: impl FnOnce(Response) -> Option<T>,
    ) -> CoreResult<T> {
        let location = SourceLocation::caller();
        if !self.is_running() {
            // Nothing would ever complete the request.
            return Err(CoreErrorInfo {
                code: CommonErrc::RequestCanceled.into(),
                location,
                message: format!("unable to execute {}: I/O loop is not running", operation),
                context: ErrorContext::Empty,
            });
        }
        let core = Arc::clone(&self.core);
        let outcome = self
            .bridge
            .call_outcome(submit_with(move |done| core.execute(request, done)))
            .map_err(|mut err| {
                err.location = location;
                err
            })?;
        match outcome {
            Ok(response) => extract(response).ok_or_else(|| CoreErrorInfo {
                code: CommonErrc::DecodingFailure.into(),
                location,
                message: format!("unexpected response to {}", operation),
                context: ErrorContext::Empty,
            }),
            Err(failure) => {
                if let Some(detail) = &failure.message {
                    debug!(
                        operation,
                        subject = name,
                        code = failure.code.name(),
                        detail = %detail,
                        "operation failed"
                    );
                }
                Err(CoreErrorInfo {
                    code: failure.code,
                    location,
                    message: failure_message(operation, name),
                    context: context(&failure),
                })
            }
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn failure_message(operation: &str, name: &str) -> String {
    if name.is_empty() {
        format!("unable to execute {}", operation)
    } else {
        format!("unable to execute {} \"{}\"", operation, name)
    }
}
