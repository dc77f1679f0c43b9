//! Async file descriptor wrapper.
//!
//! Registers a raw fd with the reactor and provides async readability /
//! writability polling — the "register interest, get notified once" boundary
//! every higher-level socket or pipe type builds on.

use std::io;
use std::os::unix::io::RawFd;
use std::task::Poll;

use crate::promise;
use crate::reactor;

/// A file descriptor registered with the reactor for async IO.
///
/// `AsyncFd` does NOT own the file descriptor — it only manages the reactor
/// registration. The caller is responsible for closing the fd.
pub struct AsyncFd {
    handle: u64,
    fd: RawFd,
}

impl AsyncFd {
    /// Register a file descriptor with the reactor.
    pub fn new(fd: RawFd) -> io::Result<Self> {
        let handle = reactor::with(|r| r.io_register(fd));
        Ok(AsyncFd { handle, fd })
    }

    /// Returns the raw file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Wait until the fd is readable.
    ///
    /// After this returns `Ok(())`, attempt the read operation. If it
    /// returns `WouldBlock`, call `readable()` again (spurious wake).
    pub async fn readable(&self) -> io::Result<()> {
        std::future::poll_fn(|cx| {
            match reactor::with(|r| r.io_poll_readable(self.handle, cx.waker().clone())) {
                Poll::Ready(()) => Poll::Ready(Ok(())),
                Poll::Pending => {
                    promise::note_suspension();
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Wait until the fd is writable.
    ///
    /// After this returns `Ok(())`, attempt the write operation. If it
    /// returns `WouldBlock`, call `writable()` again (spurious wake).
    pub async fn writable(&self) -> io::Result<()> {
        std::future::poll_fn(|cx| {
            match reactor::with(|r| r.io_poll_writable(self.handle, cx.waker().clone())) {
                Poll::Ready(()) => Poll::Ready(Ok(())),
                Poll::Pending => {
                    promise::note_suspension();
                    Poll::Pending
                }
            }
        })
        .await
    }
}

impl Drop for AsyncFd {
    fn drop(&mut self) {
        reactor::with(|r| r.io_deregister(self.handle));
    }
}
