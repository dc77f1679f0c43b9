//! The per-thread task executor.
//!
//! Owns the ready queue of units whose wakers have fired, plus the escape
//! queue of closures that must run on the top-level context. The driving
//! loops ([`block_on`], [`run_until_idle`]) interleave ticking ready units,
//! draining escapes, and parking in the reactor.

use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use async_task::{Runnable, Task};
use concurrent_queue::ConcurrentQueue;

use crate::error::EscapeFn;
use crate::reactor;

pub(crate) struct Executor {
    /// Ready queue: units whose wakers have fired. Behind a mutex only so
    /// the fork reset can swap in a fresh queue; schedule closures hold
    /// their own `Arc` to the queue they were spawned against.
    queue: Mutex<Arc<ConcurrentQueue<Runnable>>>,
    /// Escape closures waiting for the top-level context.
    escapes: Mutex<ConcurrentQueue<EscapeFn>>,
}

thread_local! {
    static EXECUTOR: Executor = Executor::new();
}

pub(crate) fn with<R>(f: impl FnOnce(&Executor) -> R) -> R {
    EXECUTOR.with(f)
}

struct MainWake(Arc<AtomicBool>);

impl Wake for MainWake {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Executor {
    fn new() -> Self {
        Executor {
            queue: Mutex::new(Arc::new(ConcurrentQueue::unbounded())),
            escapes: Mutex::new(ConcurrentQueue::unbounded()),
        }
    }

    fn ready(&self) -> Arc<ConcurrentQueue<Runnable>> {
        self.queue.lock().unwrap().clone()
    }

    /// Bind a unit future to this executor. The returned runnable performs
    /// the first poll; wakers re-enqueue through the schedule closure.
    pub(crate) fn spawn_unit<F>(&self, future: F) -> (Runnable, Task<()>)
    where
        F: Future<Output = ()> + 'static,
    {
        let queue = self.ready();
        // The schedule fn must be Send + Sync — it captures only the queue
        // handle. Units themselves never leave this thread.
        async_task::spawn_local(future, move |runnable| {
            let _ = queue.push(runnable);
        })
    }

    /// Pop one ready unit and run it. Returns true if a unit was polled.
    pub(crate) fn try_tick(&self) -> bool {
        match self.ready().pop() {
            Ok(runnable) => {
                runnable.run();
                true
            }
            Err(_) => false,
        }
    }

    /// Queue a closure for the top-level context.
    pub(crate) fn push_escape(&self, f: EscapeFn) {
        let _ = self.escapes.lock().unwrap().push(f);
    }

    /// Run every queued escape closure, outside any unit. Returns true if
    /// any ran.
    fn drain_escapes(&self) -> bool {
        let mut any = false;
        loop {
            let next = self.escapes.lock().unwrap().pop().ok();
            match next {
                Some(f) => {
                    any = true;
                    f();
                }
                None => break,
            }
        }
        any
    }

    /// Drive the executor and reactor until `future` completes.
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = pin!(future);
        let woken = Arc::new(AtomicBool::new(true));
        let waker = Waker::from(Arc::new(MainWake(woken.clone())));
        let mut cx = Context::from_waker(&waker);

        loop {
            self.drain_escapes();

            if woken.swap(false, Ordering::SeqCst) {
                if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
                    self.drain_escapes();
                    return out;
                }
            }

            // Drive the executor: poll ready units until the queue runs dry
            // or the main future is woken.
            let mut did_work = false;
            while self.try_tick() {
                did_work = true;
                self.drain_escapes();
                if woken.load(Ordering::SeqCst) {
                    break;
                }
            }
            if woken.load(Ordering::SeqCst) {
                continue;
            }

            // Park in the reactor: non-blocking if we just did work (wakers
            // may have queued more units), short sleep otherwise.
            let timeout = if did_work {
                Some(Duration::ZERO)
            } else {
                Some(Duration::from_millis(10))
            };
            let _ = reactor::with(|r| r.react(timeout));
        }
    }

    /// Tick until no ready unit, no escape, and no already-expired timer
    /// remains. Does not wait for pending timers or IO.
    fn run_until_idle(&self) {
        loop {
            let mut progress = self.drain_escapes();
            while self.try_tick() {
                progress = true;
                self.drain_escapes();
            }
            let _ = reactor::with(|r| r.react(Some(Duration::ZERO)));
            if self.ready().is_empty() && !progress {
                break;
            }
        }
    }

    /// Fork reset: discard every queued runnable and escape inherited from
    /// the parent. Stale schedule closures keep pushing into the old queue,
    /// which nothing drains again.
    pub(crate) fn reset(&self) {
        *self.queue.lock().unwrap() = Arc::new(ConcurrentQueue::unbounded());
        *self.escapes.lock().unwrap() = ConcurrentQueue::unbounded();
    }
}

/// Block the calling thread until `future` completes, driving the ready
/// queue, escape queue, and reactor in the meantime.
///
/// This is the top-level await: code outside any coroutine parks the
/// reactor's own loop here instead of a unit.
pub fn block_on<F: Future>(future: F) -> F::Output {
    assert!(
        !crate::coro::is_coroutine(),
        "block_on may not be called from inside a coroutine"
    );
    EXECUTOR.with(|ex| ex.block_on(future))
}

/// Drive the runtime until no ready work remains. Pending timers and IO
/// are left parked.
pub fn run_until_idle() {
    EXECUTOR.with(|ex| ex.run_until_idle())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    #[test]
    fn spawn_and_tick() {
        EXECUTOR.with(|ex| {
            let counter = Arc::new(AtomicU64::new(0));
            let c = counter.clone();

            let (runnable, task) = ex.spawn_unit(async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
            task.detach();
            runnable.schedule();

            assert!(ex.try_tick(), "should have had a unit to run");
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn try_tick_empty_queue() {
        EXECUTOR.with(|ex| {
            assert!(!ex.try_tick(), "no units should be queued");
        });
    }

    #[test]
    fn block_on_immediate() {
        let out = block_on(async { 41 + 1 });
        assert_eq!(out, 42);
    }

    #[test]
    fn block_on_with_timer() {
        let start = Instant::now();
        block_on(async {
            crate::timer::sleep(Duration::from_millis(20)).await;
        });
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(20),
            "timer fired too early: {:?}",
            elapsed
        );
        // Generous tolerance — CI schedulers can be slow.
        assert!(
            elapsed <= Duration::from_millis(500),
            "timer fired too late: {:?}",
            elapsed
        );
    }

    #[test]
    fn escapes_run_outside_units() {
        EXECUTOR.with(|ex| {
            let ran = Arc::new(AtomicBool::new(false));
            let r = ran.clone();
            ex.push_escape(Box::new(move || {
                assert!(!crate::coro::is_coroutine());
                r.store(true, Ordering::SeqCst);
            }));
            assert!(ex.drain_escapes());
            assert!(ran.load(Ordering::SeqCst));
        });
    }
}
