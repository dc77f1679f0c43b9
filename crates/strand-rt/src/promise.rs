//! The deferred-result primitive.
//!
//! A [`Promise`] is a one-shot container for a future value or error with
//! ordered callback registration. It carries no scheduling logic of its own:
//! settling runs the registered callbacks synchronously, and waking parked
//! awaiters is all it ever asks of the executor.
//!
//! State transitions only `Pending → Fulfilled` or `Pending → Rejected`,
//! exactly once. Settling an already-settled promise is a no-op. Callbacks
//! registered after settlement run immediately, as if queued at registration
//! time.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::Error;

type FulfillFn<T> = Box<dyn FnOnce(&T) + Send>;
type RejectFn = Box<dyn FnOnce(&Error) + Send>;
type SettleFn = Box<dyn FnOnce() + Send>;

/// The three-state lifecycle of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

impl PromiseState {
    /// Returns `true` if the promise is no longer pending.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(Error),
}

struct Inner<T> {
    state: State<T>,
    on_fulfilled: Vec<FulfillFn<T>>,
    on_rejected: Vec<RejectFn>,
    on_settled: Vec<SettleFn>,
    /// Parked awaiters, woken on settlement.
    wakers: Vec<Waker>,
    /// Whether anyone ever awaited or registered `except` — gates the
    /// unhandled-rejection report.
    observed: bool,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            state: State::Pending,
            on_fulfilled: Vec::new(),
            on_rejected: Vec::new(),
            on_settled: Vec::new(),
            wakers: Vec::new(),
            observed: false,
        }
    }
}

/// A deferred result: fulfilled with a `T` or rejected with an [`Error`],
/// exactly once.
///
/// Cloning is shallow — all clones observe the same settlement. Awaiting a
/// promise inside a coroutine suspends that coroutine until settlement;
/// awaiting one that is already settled returns synchronously without
/// parking anything (the fast path).
pub struct Promise<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("state", &self.state()).finish()
    }
}

/// The resolve capability of a pending promise.
pub struct Resolver<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The reject capability of a pending promise.
pub struct Rejecter<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Rejecter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Create a promise and hand its settle capabilities to `executor`,
    /// called synchronously exactly once. An `Err` return rejects the
    /// promise with that error.
    pub fn new(
        executor: impl FnOnce(Resolver<T>, Rejecter<T>) -> Result<(), Error>,
    ) -> Self {
        let (promise, resolver, rejecter) = Self::pending();
        if let Err(e) = executor(resolver, rejecter.clone()) {
            rejecter.reject(e);
        }
        promise
    }

    /// Create a pending promise together with its settle capabilities.
    pub fn pending() -> (Self, Resolver<T>, Rejecter<T>) {
        let inner = Arc::new(Mutex::new(Inner::new()));
        (
            Self {
                inner: inner.clone(),
            },
            Resolver {
                inner: inner.clone(),
            },
            Rejecter { inner },
        )
    }

    /// A promise that is already fulfilled with `value`.
    pub fn fulfilled(value: T) -> Self {
        let (promise, resolver, _) = Self::pending();
        resolver.resolve(value);
        promise
    }

    /// A promise that is already rejected with `error`.
    pub fn rejected(error: Error) -> Self {
        let (promise, _, rejecter) = Self::pending();
        rejecter.reject(error);
        promise
    }

    /// Current state. Settlement is permanent, so `Fulfilled`/`Rejected`
    /// answers stay true.
    pub fn state(&self) -> PromiseState {
        match self.inner.lock().unwrap().state {
            State::Pending => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state().is_settled()
    }

    /// Register a fulfillment callback. Returns `&self` so registrations
    /// chain on the same promise — this is not a derived promise; callers
    /// that need transformation resolve a new promise from the callback.
    pub fn then(&self, f: impl FnOnce(&T) + Send + 'static) -> &Self {
        let settled_value = {
            let mut g = self.inner.lock().unwrap();
            match &g.state {
                State::Pending => {
                    g.on_fulfilled.push(Box::new(f));
                    return self;
                }
                State::Fulfilled(v) => Some(v.clone()),
                State::Rejected(_) => None,
            }
        };
        // Already settled: run immediately, outside the lock — the callback
        // may re-enter this promise.
        if let Some(v) = settled_value {
            f(&v);
        }
        self
    }

    /// Register a rejection callback. Chains like [`then`](Self::then).
    pub fn except(&self, f: impl FnOnce(&Error) + Send + 'static) -> &Self {
        let settled_error = {
            let mut g = self.inner.lock().unwrap();
            g.observed = true;
            match &g.state {
                State::Pending => {
                    g.on_rejected.push(Box::new(f));
                    return self;
                }
                State::Rejected(e) => Some(e.clone()),
                State::Fulfilled(_) => None,
            }
        };
        if let Some(e) = settled_error {
            f(&e);
        }
        self
    }

    /// Register a callback that runs on either outcome, after the
    /// outcome-specific callbacks.
    pub fn finally(&self, f: impl FnOnce() + Send + 'static) -> &Self {
        let settled = {
            let mut g = self.inner.lock().unwrap();
            match g.state {
                State::Pending => {
                    g.on_settled.push(Box::new(f));
                    return self;
                }
                _ => true,
            }
        };
        if settled {
            f();
        }
        self
    }
}

impl<T: Clone + Send + 'static> Resolver<T> {
    /// Fulfill the promise if still pending; otherwise a no-op.
    pub fn resolve(&self, value: T) {
        settle_fulfilled(&self.inner, value);
    }

    /// Resolve with another promise: settlement of the outer promise is
    /// deferred until `inner` settles (flattening), preserving exactly-once
    /// settlement of the outer. An inner promise that never settles leaves
    /// the outer pending forever.
    pub fn resolve_from(&self, inner: Promise<T>) {
        let resolver = self.clone();
        let rejecter = Rejecter {
            inner: self.inner.clone(),
        };
        inner
            .then(move |v| resolver.resolve(v.clone()))
            .except(move |e| rejecter.reject(e.clone()));
    }
}

impl<T: Clone + Send + 'static> Rejecter<T> {
    /// Reject the promise if still pending; otherwise a no-op.
    pub fn reject(&self, error: Error) {
        settle_rejected(&self.inner, error, false);
    }

    /// Reject without the unhandled-rejection report. Used for settlements
    /// that are control flow rather than errors (termination, escape).
    pub(crate) fn reject_quiet(&self, error: Error) {
        settle_rejected(&self.inner, error, true);
    }
}

fn settle_fulfilled<T: Clone>(inner: &Arc<Mutex<Inner<T>>>, value: T) {
    let (callbacks, settled, wakers) = {
        let mut g = inner.lock().unwrap();
        if !matches!(g.state, State::Pending) {
            return;
        }
        g.state = State::Fulfilled(value.clone());
        g.on_rejected.clear();
        (
            std::mem::take(&mut g.on_fulfilled),
            std::mem::take(&mut g.on_settled),
            std::mem::take(&mut g.wakers),
        )
    };
    // Callbacks run outside the lock, in registration order. A callback
    // that panics unwinds into whoever called resolve — the promise itself
    // never catches.
    for cb in callbacks {
        cb(&value);
    }
    for cb in settled {
        cb();
    }
    for waker in wakers {
        waker.wake();
    }
}

fn settle_rejected<T>(inner: &Arc<Mutex<Inner<T>>>, error: Error, quiet: bool) {
    let (callbacks, settled, wakers, unobserved) = {
        let mut g = inner.lock().unwrap();
        if !matches!(g.state, State::Pending) {
            return;
        }
        let unobserved = !quiet && !g.observed && g.on_rejected.is_empty();
        g.state = State::Rejected(error.clone());
        g.on_fulfilled.clear();
        (
            std::mem::take(&mut g.on_rejected),
            std::mem::take(&mut g.on_settled),
            std::mem::take(&mut g.wakers),
            unobserved,
        )
    };
    if unobserved {
        // Fire-and-forget model: the error sink hears about it once, and
        // callers that care must register handlers themselves.
        log::error!("unhandled coroutine error: {error}");
    }
    for cb in callbacks {
        cb(&error);
    }
    for cb in settled {
        cb();
    }
    for waker in wakers {
        waker.wake();
    }
}

/// The await binding. Polling a settled promise completes synchronously
/// without touching the waker; polling a pending one parks the caller and
/// counts one suspension event.
impl<T: Clone + Send + 'static> Future for Promise<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut g = self.inner.lock().unwrap();
        match &g.state {
            State::Fulfilled(v) => Poll::Ready(Ok(v.clone())),
            State::Rejected(e) => Poll::Ready(Err(e.clone())),
            State::Pending => {
                g.observed = true;
                let waker = cx.waker();
                if !g.wakers.iter().any(|w| w.will_wake(waker)) {
                    g.wakers.push(waker.clone());
                }
                note_suspension();
                Poll::Pending
            }
        }
    }
}

thread_local! {
    static SUSPENSIONS: Cell<u64> = Cell::new(0);
}

/// Number of suspension events on this thread's runtime since start (or the
/// last fork reset). The fast path for settled promises never increments it.
pub fn suspension_count() -> u64 {
    SUSPENSIONS.with(|c| c.get())
}

pub(crate) fn note_suspension() {
    SUSPENSIONS.with(|c| c.set(c.get() + 1));
}

pub(crate) fn reset_suspensions() {
    SUSPENSIONS.with(|c| c.set(0));
}
