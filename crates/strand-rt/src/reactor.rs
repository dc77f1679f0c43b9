//! Readiness notification for fds and timers.
//!
//! The reactor is the external-collaborator half of the runtime: "register
//! interest, get notified once". Each thread's runtime owns one reactor
//! instance; [`react`](Reactor::react) is only ever driven from that thread's
//! top-level loop.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use polling::{Event, Events, Poller};
use slab::Slab;

/// An IO source registered with the reactor.
struct Source {
    raw_fd: i32,
    key: usize,
    /// Whether we've called poller.add() for this source.
    registered: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    /// Set by react() when the OS reports readiness; cleared by the poll.
    read_ready: bool,
    write_ready: bool,
}

/// Timer state: BTreeMap for ordered expiry iteration, HashMap for
/// handle→deadline lookup.
struct TimerState {
    heap: BTreeMap<(Instant, u64), Waker>,
    deadlines: HashMap<u64, Instant>,
}

/// Owns the OS poller, IO sources, and timer heap for one runtime.
pub(crate) struct Reactor {
    poller: Poller,
    sources: Mutex<Slab<Source>>,
    timers: Mutex<TimerState>,
    timer_id: AtomicU64,
    events: Mutex<Events>,
}

thread_local! {
    static REACTOR: Reactor = Reactor::new();
}

pub(crate) fn with<R>(f: impl FnOnce(&Reactor) -> R) -> R {
    REACTOR.with(f)
}

impl Reactor {
    fn new() -> Self {
        Reactor {
            poller: Poller::new().expect("failed to create OS poller"),
            sources: Mutex::new(Slab::new()),
            timers: Mutex::new(TimerState {
                heap: BTreeMap::new(),
                deadlines: HashMap::new(),
            }),
            timer_id: AtomicU64::new(0),
            events: Mutex::new(Events::new()),
        }
    }

    // ── IO ──────────────────────────────────────────────────────────

    /// Register a file descriptor. Returns an opaque handle (slab key).
    /// The fd is NOT added to the OS poller yet — that happens on first poll.
    pub(crate) fn io_register(&self, fd: i32) -> u64 {
        let mut sources = self.sources.lock().unwrap();
        let entry = sources.vacant_entry();
        let key = entry.key();
        entry.insert(Source {
            raw_fd: fd,
            key,
            registered: false,
            read_waker: None,
            write_waker: None,
            read_ready: false,
            write_ready: false,
        });
        key as u64
    }

    /// Deregister an IO source. Removes from the OS poller if registered.
    pub(crate) fn io_deregister(&self, handle: u64) {
        let mut sources = self.sources.lock().unwrap();
        let key = handle as usize;
        if sources.contains(key) {
            let source = sources.remove(key);
            if source.registered {
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(source.raw_fd) };
                // Ignore errors — the fd may already be closed by the caller.
                let _ = self.poller.delete(&borrowed);
            }
        }
    }

    /// Poll for readability. Stores the waker and registers interest.
    /// Returns Ready if already known readable, Pending otherwise.
    pub(crate) fn io_poll_readable(&self, handle: u64, waker: Waker) -> Poll<()> {
        let mut sources = self.sources.lock().unwrap();
        let key = handle as usize;
        let source = &mut sources[key];

        if source.read_ready {
            source.read_ready = false;
            return Poll::Ready(());
        }

        source.read_waker = Some(waker);
        self.update_interest(source);
        Poll::Pending
    }

    /// Poll for writability. Stores the waker and registers interest.
    pub(crate) fn io_poll_writable(&self, handle: u64, waker: Waker) -> Poll<()> {
        let mut sources = self.sources.lock().unwrap();
        let key = handle as usize;
        let source = &mut sources[key];

        if source.write_ready {
            source.write_ready = false;
            return Poll::Ready(());
        }

        source.write_waker = Some(waker);
        self.update_interest(source);
        Poll::Pending
    }

    /// Sync OS poller interest with current waker state.
    fn update_interest(&self, source: &mut Source) {
        let interest = Event::new(
            source.key,
            source.read_waker.is_some(),
            source.write_waker.is_some(),
        );

        if source.registered {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(source.raw_fd) };
            // modify() re-arms oneshot interest.
            let _ = self.poller.modify(&borrowed, interest);
        } else {
            // First registration — add() is unsafe because we must delete before fd close.
            unsafe {
                let _ = self.poller.add(source.raw_fd, interest);
            }
            source.registered = true;
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Create a timer that fires `nanos_from_now` nanoseconds from now.
    /// Returns an opaque timer handle.
    pub(crate) fn timer_create(&self, nanos_from_now: u64) -> u64 {
        let id = self.timer_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_nanos(nanos_from_now);
        let mut state = self.timers.lock().unwrap();
        state.deadlines.insert(id, deadline);
        // Waker is stored on first timer_poll, not here.
        id
    }

    /// Cancel a pending timer. The stored waker (if any) is dropped, not woken.
    pub(crate) fn timer_cancel(&self, id: u64) {
        let mut state = self.timers.lock().unwrap();
        if let Some(deadline) = state.deadlines.remove(&id) {
            state.heap.remove(&(deadline, id));
        }
    }

    /// Poll a timer. Returns Ready if the deadline passed, Pending otherwise.
    pub(crate) fn timer_poll(&self, id: u64, waker: Waker) -> Poll<()> {
        let mut state = self.timers.lock().unwrap();
        let deadline = match state.deadlines.get(&id) {
            Some(&d) => d,
            None => return Poll::Ready(()), // Already fired or cancelled.
        };

        if Instant::now() >= deadline {
            state.deadlines.remove(&id);
            state.heap.remove(&(deadline, id));
            return Poll::Ready(());
        }

        // Not yet expired — store/replace waker.
        state.heap.insert((deadline, id), waker);
        Poll::Pending
    }

    // ── React (drives IO + timers) ─────────────────────────────────

    /// Process expired timers, poll the OS for IO events, wake ready tasks.
    pub(crate) fn react(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut wakers = Vec::new();

        // 1. Process expired timers.
        let next_timer = {
            let now = Instant::now();
            let mut state = self.timers.lock().unwrap();
            loop {
                match state.heap.keys().next().copied() {
                    Some((deadline, id)) if deadline <= now => {
                        let waker = state.heap.remove(&(deadline, id)).unwrap();
                        state.deadlines.remove(&id);
                        wakers.push(waker);
                    }
                    Some((deadline, _)) => break Some(deadline.duration_since(now)),
                    None => break None,
                }
            }
        };

        // 2. Compute effective timeout: min(caller, next_timer).
        let effective_timeout = match (timeout, next_timer) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t),
            (Some(a), Some(b)) => Some(a.min(b)),
        };

        // 3. Poll the OS for IO events.
        let event_list: Vec<(usize, bool, bool)> = {
            let mut events = self.events.lock().unwrap();
            events.clear();
            self.poller.wait(&mut events, effective_timeout)?;
            events
                .iter()
                .map(|ev| (ev.key, ev.readable, ev.writable))
                .collect()
        };

        // 4. Process IO events — collect wakers.
        {
            let mut sources = self.sources.lock().unwrap();
            for (key, readable, writable) in event_list {
                if let Some(source) = sources.get_mut(key) {
                    if readable {
                        source.read_ready = true;
                        if let Some(waker) = source.read_waker.take() {
                            wakers.push(waker);
                        }
                    }
                    if writable {
                        source.write_ready = true;
                        if let Some(waker) = source.write_waker.take() {
                            wakers.push(waker);
                        }
                    }
                }
            }
        }

        // 5. Wake all — tasks re-enter the executor's ready queue.
        for waker in wakers {
            waker.wake();
        }

        Ok(())
    }

    // ── Fork reset ─────────────────────────────────────────────────

    /// Discard every source and timer. Stored wakers are dropped, not woken —
    /// they reference units that do not survive process duplication. Fds must
    /// be re-registered by their owners in the child.
    pub(crate) fn clear(&self) {
        let mut sources = self.sources.lock().unwrap();
        for (_, source) in sources.iter() {
            if source.registered {
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(source.raw_fd) };
                let _ = self.poller.delete(&borrowed);
            }
        }
        sources.clear();
        drop(sources);

        let mut timers = self.timers.lock().unwrap();
        timers.heap.clear();
        timers.deadlines.clear();
        self.timer_id.store(0, Ordering::Relaxed);
    }
}
