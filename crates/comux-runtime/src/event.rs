//! Per-coroutine one-shot wake primitive
//!
//! An eventfd counter: readable exactly when `trigger` has been called
//! and `clear` has not since. Every suspended coroutine contributes its
//! event fd to the machine's pollset; triggering it is how a Call wakes
//! a callee, how YieldValue wakes a caller, and how a Wait is cancelled.

use crate::last_errno;
use comux_core::error::{CoroError, CoroResult};
use std::os::unix::io::RawFd;

/// One-shot, poll-observable readiness signal.
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Create and arm a fresh event fd (nonblocking, close-on-exec,
    /// initially unreadable).
    pub fn new() -> CoroResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(CoroError::EventSetupFailed(last_errno()));
        }
        Ok(Self { fd })
    }

    /// Raw descriptor for the pollset.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Armed pollset entry: readable exactly between a trigger and the
    /// next clear.
    pub fn pollfd(&self) -> libc::pollfd {
        libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        }
    }

    /// Mark readable. Idempotent between clears: repeated triggers
    /// coalesce into a single wake (eventfd counter semantics), and
    /// EAGAIN on an overflowing counter just means a wake is already
    /// pending.
    pub fn trigger(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            if errno != libc::EAGAIN {
                comux_core::cwarn!("eventfd trigger failed: errno {}", errno);
            }
        }
    }

    /// Return to the unreadable state. A no-op if not triggered.
    pub fn clear(&self) {
        let mut buf: u64 = 0;
        unsafe {
            // Nonblocking read drains the counter; EAGAIN means it was
            // already clear.
            libc::read(
                self.fd,
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Poll-style check of the readable state (test helper).
    pub fn is_triggered(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        n == 1 && (pfd.revents & libc::POLLIN) != 0
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}
