//! Cancellation tree hanging off every request [`Context`](crate::Context).
//!
//! # Shape
//!
//! A [`Scope`] is two immutable chains that share nothing mutable:
//!
//! ```text
//! values:  Entry("user") ──▶ Entry("trace") ──▶ (App values, e.g. the server handle)
//! signal:  Signal(timeout) ──▶ Signal(cancel) ──▶ Signal(root context)
//! ```
//!
//! `with_value` pushes an [`Entry`] and reuses the current signal.
//! `with_cancel` / `with_deadline` / `with_timeout` push a [`Signal`] whose
//! token is a child of the current one and reuse the current values.
//!
//! Completion travels root → leaves through `CancellationToken` child
//! tokens: every derived signal registers with its parent when it is
//! created, so ending the request is one broadcast, not a walk over a
//! pointer graph.

use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::warn;

use crate::app::App;

/// A value stored in a scope, the extension store, or the settings.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Why a scope completed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CancelError {
    /// Explicit cancel, or the request ended.
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

// ── Internal nodes ────────────────────────────────────────────────────────────

struct Entry {
    key: &'static str,
    value: Value,
    next: Option<Arc<Entry>>,
}

struct Signal {
    token: CancellationToken,
    /// First cause wins. Left unset when the token was cancelled by a parent
    /// and filled lazily from the parent's reason on first `err()`.
    reason: OnceLock<CancelError>,
    deadline: Option<Instant>,
    parent: Option<Arc<Signal>>,
}

impl Signal {
    fn is_done(&self) -> bool {
        self.expire();
        self.token.is_cancelled()
    }

    fn err(&self) -> Option<CancelError> {
        if !self.is_done() {
            return None;
        }
        let reason = self.reason.get_or_init(|| {
            self.parent
                .as_deref()
                .and_then(Signal::err)
                .unwrap_or(CancelError::Canceled)
        });
        Some(*reason)
    }

    fn cancel(&self, reason: CancelError) {
        if !self.token.is_cancelled() {
            let _ = self.reason.set(reason);
        }
        self.token.cancel();
    }

    /// Fires a deadline that has passed without its timer having run.
    fn expire(&self) {
        match self.deadline {
            Some(at) if at <= Instant::now() && !self.token.is_cancelled() => {
                self.cancel(CancelError::DeadlineExceeded);
            }
            _ => {}
        }
    }
}

/// Cancels `signal` with `DeadlineExceeded` at `at`, unless it completes first.
///
/// The timer runs on the current runtime, else on the one the request was
/// created in. With neither, the deadline is only noticed by `err` and
/// `is_done`.
fn arm(signal: &Arc<Signal>, at: Instant, runtime: Option<&Handle>) {
    if at <= Instant::now() {
        signal.cancel(CancelError::DeadlineExceeded);
        return;
    }
    let Some(runtime) = Handle::try_current().ok().or_else(|| runtime.cloned()) else {
        warn!("no tokio runtime for deadline timer; deadline fires on next check");
        return;
    };
    let signal = Arc::clone(signal);
    runtime.spawn(async move {
        tokio::select! {
            () = signal.token.cancelled() => {}
            () = sleep_until(at) => signal.cancel(CancelError::DeadlineExceeded),
        }
    });
}

// ── Scope ─────────────────────────────────────────────────────────────────────

/// A node in the cancellation tree: the root of a request or a context
/// derived from it.
///
/// Cheap to clone; clones observe the same completion. Move a clone into a
/// spawned task and await [`Scope::done`] to stop work when the request ends.
///
/// ```rust,ignore
/// let (scope, _cancel) = ctx.with_timeout(Duration::from_secs(2));
/// tokio::spawn(async move {
///     tokio::select! {
///         () = scope.done() => tracing::debug!(err = ?scope.err(), "gave up"),
///         res = call_downstream() => { /* … */ }
///     }
/// });
/// ```
#[derive(Clone)]
pub struct Scope {
    app: Arc<App>,
    values: Option<Arc<Entry>>,
    signal: Arc<Signal>,
    runtime: Option<Handle>,
}

impl Scope {
    pub(crate) fn root(app: Arc<App>, deadline: Option<Instant>) -> Self {
        let signal = Arc::new(Signal {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
            deadline,
            parent: None,
        });
        let runtime = Handle::try_current().ok();
        if let Some(at) = deadline {
            arm(&signal, at, runtime.as_ref());
        }
        Self { app, values: None, signal, runtime }
    }

    /// The time at which this scope completes on its own, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.signal.deadline
    }

    /// Resolves once this scope has completed. Owned, so it can be moved
    /// into a spawned task.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.signal.token.clone().cancelled_owned()
    }

    pub fn is_done(&self) -> bool {
        self.signal.is_done()
    }

    /// `None` until completion, then the reason it completed.
    pub fn err(&self) -> Option<CancelError> {
        self.signal.err()
    }

    /// Looks `key` up in this scope, then its parents, then the
    /// process-wide values of the owning [`App`].
    pub fn value(&self, key: &str) -> Option<Value> {
        let mut entry = self.values.as_deref();
        while let Some(e) = entry {
            if e.key == key {
                return Some(Arc::clone(&e.value));
            }
            entry = e.next.as_deref();
        }
        self.app.value(key)
    }

    /// [`value`](Self::value) downcast to `T`.
    pub fn value_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.value(key)?.downcast().ok()
    }

    pub fn with_value(&self, key: &'static str, value: impl Any + Send + Sync) -> Scope {
        Scope {
            app: Arc::clone(&self.app),
            values: Some(Arc::new(Entry {
                key,
                value: Arc::new(value),
                next: self.values.clone(),
            })),
            signal: Arc::clone(&self.signal),
            runtime: self.runtime.clone(),
        }
    }

    pub fn with_cancel(&self) -> (Scope, CancelHandle) {
        self.derive(self.signal.deadline)
    }

    /// A derived scope that completes at `at` at the latest. An ancestor's
    /// earlier deadline still wins.
    ///
    /// Callable from any thread; the timer runs on the request's runtime.
    pub fn with_deadline(&self, at: Instant) -> (Scope, CancelHandle) {
        match self.signal.deadline {
            Some(inherited) if inherited <= at => self.derive(Some(inherited)),
            _ => {
                let (scope, handle) = self.derive(Some(at));
                arm(&scope.signal, at, self.runtime.as_ref());
                (scope, handle)
            }
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> (Scope, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    fn derive(&self, deadline: Option<Instant>) -> (Scope, CancelHandle) {
        let signal = Arc::new(Signal {
            token: self.signal.token.child_token(),
            reason: OnceLock::new(),
            deadline,
            parent: Some(Arc::clone(&self.signal)),
        });
        let scope = Scope {
            app: Arc::clone(&self.app),
            values: self.values.clone(),
            signal: Arc::clone(&signal),
            runtime: self.runtime.clone(),
        };
        (scope, CancelHandle { signal })
    }

    /// Completes this scope and everything derived from it.
    pub(crate) fn cancel(&self, reason: CancelError) {
        self.signal.cancel(reason);
    }
}

/// Explicit cancel for a scope returned by `with_cancel`, `with_deadline`
/// or `with_timeout`. Dropping it does not cancel.
#[derive(Clone)]
pub struct CancelHandle {
    signal: Arc<Signal>,
}

impl CancelHandle {
    /// Idempotent; never blocks.
    pub fn cancel(&self) {
        self.signal.cancel(CancelError::Canceled);
    }
}
