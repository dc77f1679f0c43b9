//! Fork guard: coroutine state does not survive process duplication.
//!
//! Units are tied to OS-level execution state that the child does not
//! inherit cleanly, so the instant the process is duplicated the child must
//! start from an empty coroutine table. Subsystems that hold their own
//! handles (fds, pids, caches) register an [`on_fork`] callback to
//! reinitialize themselves at the same moment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Once};

use crate::{context, coro, executor, promise, reactor};

/// One-shot callback run in the child after the next process duplication.
type ForkCallback = Box<dyn FnOnce() + Send>;

/// Cancelable registration returned by [`on_fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkHandle(u64);

struct Entry {
    id: u64,
    callback: ForkCallback,
}

struct ForkRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

thread_local! {
    static FORK: ForkRegistry = ForkRegistry {
        entries: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(0),
    };
}

/// Register `callback` to run once in the child after the next process
/// duplication. Callbacks run in registration order and are removed as they
/// are invoked.
pub fn on_fork(callback: impl FnOnce() + Send + 'static) -> ForkHandle {
    FORK.with(|fork| {
        let id = fork.next_id.fetch_add(1, Ordering::Relaxed);
        fork.entries.lock().unwrap().push(Entry {
            id,
            callback: Box::new(callback),
        });
        ForkHandle(id)
    })
}

/// Remove a pending registration. A no-op if the callback already ran or was
/// already cancelled.
pub fn cancel_on_fork(handle: ForkHandle) {
    FORK.with(|fork| {
        fork.entries.lock().unwrap().retain(|e| e.id != handle.0);
    })
}

/// The child-side duplication notification: run the reset pass.
///
/// In order: (1) every registered fork callback, once, in registration
/// order; (2) discard the coroutine table, every context map, queued
/// runnables and escapes, and all reactor timers/sources inherited from the
/// parent; (3) launcher bookkeeping starts fresh, exactly as at process
/// start. Runs synchronously — there is no window in which the child can
/// observe parent coroutine state.
pub fn handle_forked() {
    let entries = FORK.with(|fork| std::mem::take(&mut *fork.entries.lock().unwrap()));
    let discarded = coro::coroutine_count();
    for entry in entries {
        (entry.callback)();
    }

    coro::reset();
    context::reset();
    executor::with(|ex| ex.reset());
    reactor::with(|r| r.clear());
    promise::reset_suspensions();

    if discarded > 0 {
        log::debug!("fork reset discarded {discarded} inherited coroutines");
    }
}

extern "C" fn atfork_child() {
    handle_forked();
}

/// Wire [`handle_forked`] into `pthread_atfork` so the reset runs in the
/// child before `fork()` returns. Installing more than once registers the
/// hook once.
pub fn install_fork_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(atfork_child));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::{coroutine_count, go};
    use crate::promise::Promise;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn callbacks_run_once_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            on_fork(move || order.lock().unwrap().push(name));
        }

        handle_forked();
        assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);

        // One-shot: a second duplication runs nothing.
        handle_forked();
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn cancelled_registrations_do_not_run() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let keep = on_fork(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let cancel = on_fork(|| panic!("cancelled callback must not run"));

        cancel_on_fork(cancel);
        // Cancelling twice is fine.
        cancel_on_fork(cancel);
        handle_forked();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let _ = keep;
    }

    #[test]
    fn reset_empties_coroutine_and_context_state() {
        // Park a unit on a promise that never settles.
        let (gate, _resolver, _rejecter) = Promise::<u32>::pending();
        let (_p, _h) = go(async move {
            crate::context::set("inherited", 1u8);
            let v = gate.await?;
            Ok(v)
        });
        crate::context::set("root_key", 2u8);
        assert_eq!(coroutine_count(), 1);

        handle_forked();

        assert_eq!(coroutine_count(), 0);
        assert!(crate::context::get("root_key").is_none());
        assert_eq!(crate::promise::suspension_count(), 0);
    }

    #[test]
    fn reset_runs_callbacks_before_discarding_tables() {
        let seen = Arc::new(Mutex::new(None));
        let (_p, _h) = go(async {
            let (gate, _r, _rj) = Promise::<u32>::pending();
            let v = gate.await?;
            Ok(v)
        });

        let s = seen.clone();
        on_fork(move || {
            // Callbacks observe the table before it is discarded.
            *s.lock().unwrap() = Some(coroutine_count());
        });
        handle_forked();

        assert_eq!(*seen.lock().unwrap(), Some(1));
        assert_eq!(coroutine_count(), 0);
    }
}
