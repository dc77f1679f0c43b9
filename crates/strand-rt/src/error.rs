//! Runtime error taxonomy.
//!
//! Errors are `Clone` because a single rejection has to reach every observer
//! of a promise: each `except` callback, every parked awaiter, and the
//! unhandled-rejection sink.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Code carried by an escape signal, executed on the top-level context.
pub type EscapeFn = Box<dyn FnOnce() + Send>;

/// Shared one-shot slot for an escape closure.
///
/// The `Error` enum must be `Clone`, but the carried closure is `FnOnce` —
/// clones share the slot and exactly one invoker gets to take the closure.
#[derive(Clone)]
pub struct EscapeCell(Arc<Mutex<Option<EscapeFn>>>);

impl EscapeCell {
    pub(crate) fn new(f: EscapeFn) -> Self {
        Self(Arc::new(Mutex::new(Some(f))))
    }

    /// Take the carried closure. Returns `None` if already taken.
    pub(crate) fn take(&self) -> Option<EscapeFn> {
        self.0.lock().unwrap().take()
    }
}

impl fmt::Debug for EscapeCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let taken = self.0.lock().unwrap().is_none();
        f.debug_struct("EscapeCell").field("taken", &taken).finish()
    }
}

/// Everything a promise can be rejected with.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An error raised by user-supplied coroutine code or a rejected promise
    /// it awaited. Never crashes the process.
    #[error("{0}")]
    App(String),

    /// I/O error surfaced through the reactor boundary.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// Installed as the governing rejection by [`CoroHandle::terminate`].
    ///
    /// [`CoroHandle::terminate`]: crate::CoroHandle::terminate
    #[error("coroutine was terminated")]
    Terminated,

    /// Produced by [`timeout`](crate::timeout) when the timer wins the race.
    #[error("operation timed out")]
    TimedOut,

    /// Control-flow marker, not an application error: the carried closure
    /// must run on the top-level execution context, outside any coroutine.
    /// Catch-all handlers must re-raise this variant unmodified.
    #[error("escape to the top-level context requested")]
    Escape(EscapeCell),

    /// What an escaping coroutine's own governing promise is rejected with
    /// after its carried closure has been handed to the top level.
    #[error("coroutine escaped to the top-level context")]
    Escaped,
}

impl Error {
    /// Wrap any displayable value as an application error.
    pub fn app(msg: impl fmt::Display) -> Self {
        Error::App(msg.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

/// Build an escape signal carrying `f`.
///
/// Return this from a coroutine body to request that `f` run once,
/// uninterrupted, on the top-level execution context. The launcher never
/// converts it into an ordinary rejection; the driving loop invokes `f`
/// outside any unit and then resumes normal operation.
pub fn escape(f: impl FnOnce() + Send + 'static) -> Error {
    Error::Escape(EscapeCell::new(Box::new(f)))
}
