//! The coroutine launcher.
//!
//! [`go`] binds a unit — one cooperative, suspendable sequence of execution —
//! to a governing [`Promise`] and the per-thread executor. The launcher owns
//! the coroutine table; each record lives from spawn until its unit returns,
//! errors, or is force-terminated from outside, and is removed after any of
//! those.
//!
//! Per-coroutine lifecycle:
//! `Created → Running → Suspended → Running → … → Completed | Failed | Terminated`

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_task::Task;
use slab::Slab;

use crate::context;
use crate::error::Error;
use crate::executor;
use crate::promise::{Promise, Rejecter, Resolver};

pub(crate) type CoroId = usize;

/// Lifecycle states of a coroutine.
///
/// Terminal states (`Completed`, `Failed`, `Terminated`) coincide with the
/// record's removal from the table, so [`CoroHandle::state`] only ever
/// observes the live ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroState {
    /// Registered, not yet polled.
    Created,
    /// Currently executing on the cooperative thread.
    Running,
    /// Parked at an await, waiting for a settlement or readiness wake.
    Suspended,
    /// Ran to completion; governing promise fulfilled.
    Completed,
    /// Unit returned an error; governing promise rejected.
    Failed,
    /// Force-terminated from outside; never resumed again.
    Terminated,
}

struct CoroRecord {
    state: CoroState,
    /// Dropping the task handle is what guarantees a terminated unit can
    /// never be polled again.
    task: Option<Task<()>>,
    /// Quiet reject capability for the governing promise, used by terminate.
    reject: Box<dyn Fn(Error) + Send>,
}

struct Registry {
    coros: Mutex<Slab<CoroRecord>>,
}

thread_local! {
    static REGISTRY: Registry = Registry {
        coros: Mutex::new(Slab::new()),
    };
    static CURRENT: Cell<Option<CoroId>> = Cell::new(None);
}

/// Id of the unit currently executing on this thread, if any.
pub(crate) fn current() -> Option<CoroId> {
    CURRENT.with(|c| c.get())
}

/// True only when called from inside a unit managed by this launcher.
pub fn is_coroutine() -> bool {
    current().is_some()
}

/// Number of live coroutine records on this thread's runtime.
pub fn coroutine_count() -> usize {
    REGISTRY.with(|reg| reg.coros.lock().unwrap().len())
}

/// External capability to force-end a running coroutine.
///
/// Returned by [`go`]; cheap to copy and valid for the lifetime of the
/// runtime (operations on a finished coroutine are no-ops).
#[derive(Debug, Clone, Copy)]
pub struct CoroHandle {
    id: CoroId,
}

impl CoroHandle {
    /// Force-terminate the coroutine: reject its governing promise with
    /// [`Error::Terminated`] and abandon the unit — it is never resumed
    /// again, even if a promise it was awaiting settles later.
    ///
    /// No cleanup runs inside the terminated body; `finally` registrations
    /// on promises the coroutine owned are the cleanup mechanism. Calling
    /// this on an already-finished coroutine is a no-op.
    pub fn terminate(&self) {
        let record = REGISTRY.with(|reg| {
            let mut coros = reg.coros.lock().unwrap();
            if coros.contains(self.id) {
                Some(coros.remove(self.id))
            } else {
                None
            }
        });
        let Some(record) = record else { return };

        // Drop the task first: from here on the unit cannot be polled, no
        // matter what the reject callbacks below do.
        drop(record.task);
        (record.reject)(Error::Terminated);
        context::discard(self.id);
    }

    /// Live state of the coroutine, or `None` once it has finished (its
    /// record is removed at completion, failure, or termination).
    pub fn state(&self) -> Option<CoroState> {
        REGISTRY.with(|reg| reg.coros.lock().unwrap().get(self.id).map(|r| r.state))
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_none()
    }
}

/// The unit wrapper: drives the user body, tracks lifecycle state, and
/// settles the governing promise at the end.
struct Unit<T: Clone + Send + 'static> {
    id: CoroId,
    body: Pin<Box<dyn Future<Output = Result<T, Error>>>>,
    resolver: Resolver<T>,
    rejecter: Rejecter<T>,
}

impl<T: Clone + Send + 'static> Future for Unit<T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let id = self.id;

        // Resume guard: a resume delivered to a unit whose record is gone is
        // a fatal programming error in the caller. Drop it without touching
        // the rest of the table.
        let live = REGISTRY.with(|reg| {
            let mut coros = reg.coros.lock().unwrap();
            match coros.get_mut(id) {
                Some(record) => {
                    record.state = CoroState::Running;
                    true
                }
                None => false,
            }
        });
        if !live {
            log::error!("resume delivered to finished coroutine {id}; discarding");
            return Poll::Ready(());
        }

        let prev = CURRENT.with(|c| c.replace(Some(id)));
        let polled = self.body.as_mut().poll(cx);
        CURRENT.with(|c| c.set(prev));

        match polled {
            Poll::Pending => {
                REGISTRY.with(|reg| {
                    if let Some(record) = reg.coros.lock().unwrap().get_mut(id) {
                        record.state = CoroState::Suspended;
                    }
                });
                Poll::Pending
            }
            Poll::Ready(result) => {
                retire(id);
                context::discard(id);
                match result {
                    Ok(value) => self.resolver.resolve(value),
                    Err(Error::Escape(cell)) => {
                        // Control flow, not a failure: hand the carried code
                        // to the top-level context. This unit is done; its
                        // promise gets the distinct marker so awaiting
                        // parents are not parked forever.
                        if let Some(f) = cell.take() {
                            executor::with(|ex| ex.push_escape(f));
                        }
                        self.rejecter.reject_quiet(Error::Escaped);
                    }
                    Err(e) => self.rejecter.reject(e),
                }
                Poll::Ready(())
            }
        }
    }
}

/// Remove a finished coroutine's record, detaching its task handle so the
/// completed unit is freed without a self-cancel.
fn retire(id: CoroId) {
    let task = REGISTRY.with(|reg| {
        let mut coros = reg.coros.lock().unwrap();
        if coros.contains(id) {
            coros.remove(id).task
        } else {
            None
        }
    });
    if let Some(task) = task {
        task.detach();
    }
}

/// Spawn a coroutine and return its governing promise together with a
/// termination handle.
///
/// The body starts immediately: it runs synchronously on the calling thread
/// until its first suspension (or straight to completion, in which case the
/// promise is already settled when `go` returns). The child's context is a
/// snapshot of the caller's at this instant.
pub fn go<T, F>(body: F) -> (Promise<T>, CoroHandle)
where
    T: Clone + Send + 'static,
    F: Future<Output = Result<T, Error>> + 'static,
{
    let (promise, resolver, rejecter) = Promise::pending();

    let id = REGISTRY.with(|reg| {
        let quiet = rejecter.clone();
        reg.coros.lock().unwrap().insert(CoroRecord {
            state: CoroState::Created,
            task: None,
            reject: Box::new(move |e| quiet.reject_quiet(e)),
        })
    });

    context::adopt(id);

    let unit = Unit {
        id,
        body: Box::pin(body),
        resolver,
        rejecter,
    };

    let (runnable, task) = executor::with(|ex| ex.spawn_unit(unit));
    REGISTRY.with(|reg| {
        if let Some(record) = reg.coros.lock().unwrap().get_mut(id) {
            record.task = Some(task);
        } else {
            task.detach();
        }
    });

    // First poll, synchronous, until the first suspension.
    runnable.run();

    (promise, CoroHandle { id })
}

/// [`go`] with the termination handle discarded.
pub fn spawn<T, F>(body: F) -> Promise<T>
where
    T: Clone + Send + 'static,
    F: Future<Output = Result<T, Error>> + 'static,
{
    go(body).0
}

/// Fork reset: discard every record inherited from the parent process.
/// Dropping the task handles guarantees the stale units are never polled.
pub(crate) fn reset() {
    REGISTRY.with(|reg| reg.coros.lock().unwrap().clear());
    CURRENT.with(|c| c.set(None));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::block_on;
    use crate::promise::{suspension_count, PromiseState};
    use crate::timer::sleep;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn body_runs_synchronously_until_first_suspension() {
        let reached = Arc::new(AtomicBool::new(false));
        let r = reached.clone();
        let (promise, _handle) = go(async move {
            r.store(true, Ordering::SeqCst);
            sleep(Duration::from_millis(5)).await;
            Ok(1u32)
        });
        // The store happened before go returned; the unit is now parked.
        assert!(reached.load(Ordering::SeqCst));
        assert_eq!(promise.state(), PromiseState::Pending);
        assert_eq!(block_on(promise).unwrap(), 1);
    }

    #[test]
    fn immediate_return_settles_before_go_returns() {
        let (promise, handle) = go(async { Ok::<_, Error>("done") });
        assert_eq!(promise.state(), PromiseState::Fulfilled);
        assert!(handle.is_finished());
        assert_eq!(coroutine_count(), 0);
    }

    #[test]
    fn body_error_rejects_governing_promise() {
        let (promise, _handle) = go(async { Err::<u32, _>(Error::app("exploded")) });
        assert_eq!(promise.state(), PromiseState::Rejected);
        match block_on(promise) {
            Err(Error::App(msg)) => assert_eq!(msg, "exploded"),
            other => panic!("expected App rejection, got {other:?}"),
        }
    }

    #[test]
    fn awaiting_a_settled_promise_never_suspends() {
        let before = suspension_count();
        let settled = Promise::fulfilled(7u32);
        let (promise, _handle) = go(async move {
            let v = settled.await?;
            Ok(v + 1)
        });
        // Fast path: the unit ran to completion inside go, with zero parks.
        assert_eq!(promise.state(), PromiseState::Fulfilled);
        assert_eq!(suspension_count(), before);
    }

    #[test]
    fn is_coroutine_tracks_unit_boundaries() {
        assert!(!is_coroutine());
        let (promise, _handle) = go(async {
            assert!(is_coroutine());
            Ok(is_coroutine())
        });
        assert!(!is_coroutine());
        assert!(block_on(promise).unwrap());
    }

    #[test]
    fn nested_spawn_suspends_only_the_inner_unit() {
        let (outer, _h) = go(async {
            let (inner, _h2) = go(async {
                sleep(Duration::from_millis(5)).await;
                Ok(10u32)
            });
            // The inner unit parked on its timer; we are still running.
            assert!(is_coroutine());
            let v = inner.await?;
            Ok(v + 1)
        });
        assert_eq!(block_on(outer).unwrap(), 11);
    }

    #[test]
    fn terminate_rejects_and_abandons_the_unit() {
        let resumed = Arc::new(AtomicBool::new(false));
        let r = resumed.clone();
        let (gate, gate_resolver, _gate_rejecter) = Promise::<u32>::pending();

        let (promise, handle) = go(async move {
            let v = gate.await?;
            r.store(true, Ordering::SeqCst);
            Ok(v)
        });

        assert_eq!(handle.state(), Some(CoroState::Suspended));
        handle.terminate();
        assert!(handle.is_finished());
        assert_eq!(coroutine_count(), 0);

        // Settling the awaited promise later must not resurrect the unit or
        // disturb its already-settled governing promise.
        gate_resolver.resolve(5);
        crate::executor::run_until_idle();
        assert!(!resumed.load(Ordering::SeqCst));
        match block_on(promise) {
            Err(Error::Terminated) => {}
            other => panic!("expected Terminated, got {other:?}"),
        }
    }

    #[test]
    fn terminate_after_completion_is_a_noop() {
        let (promise, handle) = go(async { Ok::<_, Error>(3u32) });
        handle.terminate();
        handle.terminate();
        assert_eq!(block_on(promise).unwrap(), 3);
    }

    #[test]
    fn escape_reaches_the_top_level_loop() {
        let ran_at_top = Arc::new(AtomicBool::new(false));
        let r = ran_at_top.clone();

        let (promise, _handle) = go(async move {
            Err::<u32, _>(crate::error::escape(move || {
                assert!(!is_coroutine());
                r.store(true, Ordering::SeqCst);
            }))
        });

        // The carried closure waits in the escape queue until the top-level
        // loop drains it.
        assert!(!ran_at_top.load(Ordering::SeqCst));
        crate::executor::run_until_idle();
        assert!(ran_at_top.load(Ordering::SeqCst));
        match block_on(promise) {
            Err(Error::Escaped) => {}
            other => panic!("expected Escaped marker, got {other:?}"),
        }
    }

    #[test]
    fn context_survives_a_suspension_point() {
        let (promise, _handle) = go(async {
            context::set("k", "v1".to_string());
            sleep(Duration::from_millis(100)).await;
            Ok(context::get_as::<String>("k").map(|v| (*v).clone()))
        });
        assert_eq!(block_on(promise).unwrap(), Some("v1".to_string()));
    }

    #[test]
    fn five_sleepers_each_deliver_their_own_result() {
        let promises: Vec<_> = (0..5)
            .map(|i| {
                spawn(async move {
                    sleep(Duration::from_millis(100)).await;
                    Ok(format!("result_{i}"))
                })
            })
            .collect();

        let results = block_on(async move {
            let mut out = Vec::new();
            for p in promises {
                out.push(p.await.unwrap());
            }
            out
        });

        assert_eq!(
            results,
            ["result_0", "result_1", "result_2", "result_3", "result_4"]
        );
    }

    #[test]
    fn sibling_coroutines_schedule_independently() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let a = spawn(async move {
            sleep(Duration::from_millis(30)).await;
            o.lock().unwrap().push("slow");
            Ok(())
        });
        let o = order.clone();
        let b = spawn(async move {
            sleep(Duration::from_millis(5)).await;
            o.lock().unwrap().push("fast");
            Ok(())
        });

        block_on(async move {
            a.await.unwrap();
            b.await.unwrap();
        });

        // Scheduling order follows the awaited timers, not spawn order.
        assert_eq!(*order.lock().unwrap(), ["fast", "slow"]);
    }

    #[test]
    fn records_are_removed_on_completion() {
        let counter = Arc::new(AtomicU32::new(0));
        let before = coroutine_count();
        let c = counter.clone();
        let (_p, handle) = go(async move {
            sleep(Duration::from_millis(5)).await;
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(coroutine_count(), before + 1);
        block_on(async {
            sleep(Duration::from_millis(20)).await;
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(coroutine_count(), before);
        assert!(handle.is_finished());
    }
}
