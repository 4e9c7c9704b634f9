//! Deadline-bounded wrapper around a single outbound coordinator call
//!
//! Every call gets a [`CallContext`] whose state can leave `Pending` exactly
//! once. The first of success, remote error or deadline expiry settles the
//! call; later signals are ignored. On expiry the in-flight future is
//! dropped, which resets the HTTP/2 stream. That cancellation is advisory:
//! the coordinator may already have committed the work.

use crate::error::GatewayError;
use crate::sanitize::sanitize_status;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tonic::metadata::MetadataValue;
use tracing::{debug, warn};

/// Metadata key carrying the absolute deadline in unix milliseconds
pub const DEADLINE_METADATA_KEY: &str = "x-deadline-unix-ms";

/// Lifecycle of a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Resolved,
    Rejected,
    TimedOut,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallState::Pending)
    }
}

/// Per-call bookkeeping, owned by the call's execution
#[derive(Debug)]
pub struct CallContext {
    method: &'static str,
    timeout: Duration,
    deadline: Instant,
    deadline_unix_ms: u64,
    state: Mutex<CallState>,
}

impl CallContext {
    pub fn new(method: &'static str, timeout: Duration) -> Self {
        let deadline_unix_ms = SystemTime::now()
            .checked_add(timeout)
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            method,
            timeout,
            deadline: Instant::now() + timeout,
            deadline_unix_ms,
            state: Mutex::new(CallState::Pending),
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn deadline_unix_ms(&self) -> u64 {
        self.deadline_unix_ms
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// Move from `Pending` to `outcome`. Returns false, leaving the state
    /// untouched, if the call has already settled.
    pub fn settle(&self, outcome: CallState) -> bool {
        debug_assert!(outcome.is_terminal(), "cannot settle into Pending");
        let mut state = self.state.lock();
        if state.is_terminal() || !outcome.is_terminal() {
            return false;
        }
        *state = outcome;
        true
    }

    /// Attach the deadline to an outgoing request, both as the gRPC
    /// timeout header and as absolute-time metadata.
    pub fn attach<T>(&self, request: &mut tonic::Request<T>) {
        request.set_timeout(self.timeout);
        if let Ok(value) = MetadataValue::try_from(self.deadline_unix_ms.to_string()) {
            request.metadata_mut().insert(DEADLINE_METADATA_KEY, value);
        }
    }
}

/// Releases an in-flight slot exactly once, however the call ends
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Issues calls with a deadline and sanitizes their failures
#[derive(Debug, Clone)]
pub struct RpcCaller {
    timeout: Duration,
    debug: bool,
    in_flight: Arc<AtomicUsize>,
    timeouts: Arc<AtomicU64>,
}

impl RpcCaller {
    pub fn new(timeout: Duration, debug: bool) -> Self {
        Self {
            timeout,
            debug,
            in_flight: Arc::new(AtomicUsize::new(0)),
            timeouts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of calls currently awaiting a response
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of calls that hit their deadline since startup
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::SeqCst)
    }

    /// Run `call` with the default timeout
    pub async fn call<T, F, Fut>(&self, method: &'static str, call: F) -> Result<T, GatewayError>
    where
        F: FnOnce(Arc<CallContext>) -> Fut,
        Fut: Future<Output = Result<T, tonic::Status>>,
    {
        self.call_with_timeout(method, self.timeout, call).await
    }

    /// Run `call` under `timeout`.
    ///
    /// `call` receives the context so it can [`attach`](CallContext::attach)
    /// the deadline to its request.
    pub async fn call_with_timeout<T, F, Fut>(
        &self,
        method: &'static str,
        timeout: Duration,
        call: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(Arc<CallContext>) -> Fut,
        Fut: Future<Output = Result<T, tonic::Status>>,
    {
        let ctx = Arc::new(CallContext::new(method, timeout));
        let _guard = InFlightGuard::new(Arc::clone(&self.in_flight));
        let deadline = tokio::time::Instant::from_std(ctx.deadline());
        let fut = call(Arc::clone(&ctx));

        let outcome = tokio::select! {
            biased;
            result = fut => result.map_err(RemoteFailure::Status),
            _ = tokio::time::sleep_until(deadline) => Err(RemoteFailure::Deadline),
        };

        match outcome {
            Ok(value) => {
                ctx.settle(CallState::Resolved);
                debug!(method, "Coordinator call succeeded");
                Ok(value)
            }
            Err(RemoteFailure::Status(status)) => {
                ctx.settle(CallState::Rejected);
                if self.debug {
                    debug!(method, code = ?status.code(), raw = %status.message(), "Coordinator call failed");
                }
                let err = sanitize_status(&status, method, timeout);
                warn!(method, error = %err, "Coordinator call failed");
                Err(err)
            }
            Err(RemoteFailure::Deadline) => {
                ctx.settle(CallState::TimedOut);
                self.timeouts.fetch_add(1, Ordering::SeqCst);
                warn!(method, timeout_ms = timeout.as_millis() as u64, "Coordinator call timed out, cancelling");
                Err(GatewayError::Timeout { method, timeout })
            }
        }
    }
}

enum RemoteFailure {
    Status(tonic::Status),
    Deadline,
}
