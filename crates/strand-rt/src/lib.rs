//! strand-rt: single-threaded cooperative coroutine runtime.
//!
//! Code written in ordinary sequential style suspends at promise and timer
//! boundaries and resumes later, without blocking the whole process. One
//! runtime per OS thread, held in thread-local state — "concurrency" is
//! interleaving at explicit suspension points, never preemption, so shared
//! in-process state is race-free by construction as long as no `.await`
//! sits between a read and the matching write.
//!
//! The pieces:
//! - [`Promise`] — one-shot deferred result with ordered `then` / `except` /
//!   `finally` callbacks; awaiting a settled promise never yields control.
//! - [`go`] / [`spawn`] — bind a unit to a governing promise and start it
//!   synchronously until its first suspension. [`go`] also returns a
//!   [`CoroHandle`] for external termination.
//! - [`context`] — per-coroutine key/value store, snapshotted from the
//!   parent at spawn, isolated across siblings.
//! - [`on_fork`] / [`handle_forked`] — fork guard: the child of a process
//!   duplication starts with an empty coroutine table instead of inheriting
//!   the parent's in-flight suspensions.
//! - [`sleep`] / [`timeout`] / [`AsyncFd`] — the reactor-backed suspension
//!   surface for timers and fd readiness.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use strand_rt::{block_on, context, go, sleep, Error};
//!
//! let result = block_on(async {
//!     context::set("who", "parent".to_string());
//!     let (greeting, _handle) = go(async {
//!         sleep(Duration::from_millis(10)).await;
//!         let who = context::get_as::<String>("who").unwrap();
//!         Ok::<_, Error>(format!("hello, {who}"))
//!     });
//!     greeting.await
//! });
//! assert_eq!(result.unwrap(), "hello, parent");
//! ```

pub mod context;

mod coro;
mod error;
mod executor;
mod fork;
mod io;
mod promise;
mod reactor;
mod timer;

pub use coro::{coroutine_count, go, is_coroutine, spawn, CoroHandle, CoroState};
pub use error::{escape, Error, EscapeCell, EscapeFn};
pub use executor::{block_on, run_until_idle};
pub use fork::{cancel_on_fork, handle_forked, install_fork_handler, on_fork, ForkHandle};
pub use io::AsyncFd;
pub use promise::{suspension_count, Promise, PromiseState, Rejecter, Resolver};
pub use timer::{sleep, timeout, Timer};
