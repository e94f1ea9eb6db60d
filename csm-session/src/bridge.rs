//! # Synchronous Bridge
//!
//! Purpose: Turn one asynchronous, callback-based cluster call into a
//! blocking call for the single-threaded host.
//!
//! ## Design Principles
//! 1. **Written Once**: Every operation is expressed as an `AsyncOperation`
//!    and goes through `SyncBridge::call`; call sites never hand-roll waits.
//! 2. **Single Resolution**: A `Signal` accepts exactly one value. A second
//!    resolution is rejected and logged, never silently overwritten.
//! 3. **No Lost Wakeups**: A completion the core drops resolves the signal
//!    with `Delivery::Abandoned`, which surfaces as `request_canceled`.
//! 4. **Synchronous Failures**: If submission itself fails, the error is
//!    returned directly and the signal is never waited on.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use csm_cluster::{Completion, Delivery};
use csm_common::{CommonErrc, CoreErrorInfo, CoreResult};

use crate::metrics::BridgeMetrics;

enum SignalState<T> {
    Pending,
    Ready(T),
    Taken,
}

/// One-shot value slot a blocked thread waits on.
pub struct Signal<T> {
    state: Mutex<SignalState<T>>,
    ready: Condvar,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Signal {
            state: Mutex::new(SignalState::Pending),
            ready: Condvar::new(),
        }
    }

    /// Stores `value` and wakes the waiter.
    ///
    /// Returns `false` (dropping `value`) if the signal was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, SignalState::Pending) {
            return false;
        }
        *state = SignalState::Ready(value);
        self.ready.notify_all();
        true
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.state.lock(), SignalState::Pending)
    }

    /// Blocks until resolved and takes the value.
    ///
    /// Returns `None` if the value was already taken by an earlier wait.
    pub fn wait(&self) -> Option<T> {
        let mut state = self.state.lock();
        while matches!(*state, SignalState::Pending) {
            self.ready.wait(&mut state);
        }
        Self::take(&mut state)
    }

    /// Like `wait`, but gives up after `timeout` and returns `None`.
    pub fn wait_for(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while matches!(*state, SignalState::Pending) {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Self::take(&mut state)
    }

    fn take(state: &mut SignalState<T>) -> Option<T> {
        match std::mem::replace(state, SignalState::Taken) {
            SignalState::Ready(value) => Some(value),
            SignalState::Pending => {
                *state = SignalState::Pending;
                None
            }
            SignalState::Taken => None,
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An asynchronous call that reports through one completion.
pub trait AsyncOperation {
    type Output: Send + 'static;

    /// Starts the call. An `Err` means nothing was scheduled.
    fn submit(self, done: Completion<Self::Output>) -> CoreResult<()>;
}

/// `AsyncOperation` built from a closure.
pub struct Submit<F, T> {
    submit: F,
    _output: PhantomData<fn() -> T>,
}

/// Wraps a closure that hands the completion to a core API.
pub fn submit_with<T, F>(submit: F) -> Submit<F, T>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>) -> CoreResult<()>,
{
    Submit {
        submit,
        _output: PhantomData,
    }
}

impl<T, F> AsyncOperation for Submit<F, T>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>) -> CoreResult<()>,
{
    type Output = T;

    fn submit(self, done: Completion<T>) -> CoreResult<()> {
        (self.submit)(done)
    }
}

/// Blocking adapter over `AsyncOperation`s.
#[derive(Clone)]
pub struct SyncBridge {
    metrics: Arc<BridgeMetrics>,
}

impl SyncBridge {
    pub fn new(metrics: Arc<BridgeMetrics>) -> Self {
        SyncBridge { metrics }
    }

    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    /// Submits `op` and blocks until its completion fires.
    ///
    /// **Output**: the delivered value, the synchronous submission error, or
    /// `request_canceled` when the core dropped the completion.
    #[track_caller]
    pub fn call<Op: AsyncOperation>(&self, op: Op) -> CoreResult<Op::Output> {
        let (signal, done) = Self::arm();
        let started = self.begin();
        op.submit(done).map_err(|err| self.submit_failed(started, err))?;
        let delivery = signal.wait();
        self.metrics.record_call_end(started.elapsed());
        self.settle(delivery)
    }

    /// Like `call` for operations whose value is itself a `Result`; the
    /// failure counter also counts resolved errors.
    #[track_caller]
    pub fn call_outcome<T, E, Op>(&self, op: Op) -> CoreResult<Result<T, E>>
    where
        Op: AsyncOperation<Output = Result<T, E>>,
    {
        let outcome = self.call(op)?;
        if outcome.is_err() {
            self.metrics.record_failure();
        }
        Ok(outcome)
    }

    /// Bounded variant of `call`.
    ///
    /// Returns `Ok(None)` if nothing was delivered within `timeout`; a late
    /// delivery is then discarded.
    #[track_caller]
    pub fn call_within<Op: AsyncOperation>(
        &self,
        op: Op,
        timeout: Duration,
    ) -> CoreResult<Option<Op::Output>> {
        let (signal, done) = Self::arm();
        let started = self.begin();
        op.submit(done).map_err(|err| self.submit_failed(started, err))?;
        let delivery = signal.wait_for(timeout);
        self.metrics.record_call_end(started.elapsed());
        match delivery {
            Some(delivery) => self.settle(Some(delivery)).map(Some),
            None => {
                self.metrics.record_failure();
                Ok(None)
            }
        }
    }

    fn arm<T: Send + 'static>() -> (Arc<Signal<Delivery<T>>>, Completion<T>) {
        let signal = Arc::new(Signal::new());
        let sink = Arc::clone(&signal);
        let done = Completion::new(move |delivery| {
            if !sink.resolve(delivery) {
                error!("bridge signal resolved twice; second result dropped");
            }
        });
        (signal, done)
    }

    fn begin(&self) -> Instant {
        self.metrics.record_call_start();
        Instant::now()
    }

    fn submit_failed(&self, started: Instant, err: CoreErrorInfo) -> CoreErrorInfo {
        self.metrics.record_call_end(started.elapsed());
        self.metrics.record_failure();
        err
    }

    #[track_caller]
    fn settle<T>(&self, delivery: Option<Delivery<T>>) -> CoreResult<T> {
        match delivery {
            Some(Delivery::Resolved(value)) => Ok(value),
            Some(Delivery::Abandoned) => {
                self.metrics.record_abandoned();
                warn!("cluster core dropped a completion without resolving it");
                Err(CoreErrorInfo::new(
                    CommonErrc::RequestCanceled,
                    "operation abandoned by the cluster core",
                ))
            }
            None => Err(CoreErrorInfo::new(
                CommonErrc::RequestCanceled,
                "bridge signal was already consumed",
            )),
        }
    }
}
