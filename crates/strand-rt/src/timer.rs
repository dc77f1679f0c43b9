//! Timers: the uniform suspension mechanism for "wait some time".
//!
//! Sleeping is awaiting a one-shot timer backed by the reactor; a timeout is
//! the same timer racing an operation's promise, with whichever settlement
//! loses simply discarded.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::coro::go;
use crate::error::Error;
use crate::promise::{self, Promise};
use crate::reactor;

/// A one-shot timer that resolves after a given duration.
///
/// Created via [`Timer::after`]. Implements `Future` so you can `.await` it.
/// Cancels its reactor entry on drop if it hasn't fired yet.
pub struct Timer {
    handle: u64,
    fired: bool,
}

impl Timer {
    /// Create a timer that fires after the given duration.
    pub fn after(duration: Duration) -> Self {
        let nanos = duration.as_nanos().min(u64::MAX as u128) as u64;
        let handle = reactor::with(|r| r.timer_create(nanos));
        Timer {
            handle,
            fired: false,
        }
    }
}

impl Future for Timer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.fired {
            return Poll::Ready(());
        }
        match reactor::with(|r| r.timer_poll(self.handle, cx.waker().clone())) {
            Poll::Ready(()) => {
                self.fired = true;
                Poll::Ready(())
            }
            Poll::Pending => {
                promise::note_suspension();
                Poll::Pending
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.fired {
            reactor::with(|r| r.timer_cancel(self.handle));
        }
    }
}

/// Suspend the calling coroutine for the given duration.
pub async fn sleep(duration: Duration) {
    Timer::after(duration).await
}

/// Race `op` against a timer. The returned promise carries whichever settles
/// first: `op`'s outcome, or a rejection with [`Error::TimedOut`] once the
/// timer fires. The loser's eventual settlement is discarded — exactly-once
/// settlement of the winner guarantees it cannot resurrect anything.
pub fn timeout<T: Clone + Send + 'static>(op: Promise<T>, duration: Duration) -> Promise<T> {
    let (winner, resolver, rejecter) = Promise::pending();

    op.then(move |v| resolver.resolve(v.clone()));
    let forward = rejecter.clone();
    op.except(move |e| forward.reject(e.clone()));

    // Internal watchdog unit: sleeps, then tries to reject the winner. If
    // the operation settled first, that reject is a no-op.
    let (_watch, watchdog) = go(async move {
        sleep(duration).await;
        rejecter.reject(Error::TimedOut);
        Ok(())
    });
    // Either outcome of the operation retires the watchdog early.
    op.finally(move || watchdog.terminate());

    winner
}
