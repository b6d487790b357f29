//! One-shot timer fds for Wait timeouts
//!
//! A Wait with a positive timeout appends a timerfd to its published
//! wait set; the machine treats its readiness as "timeout fired". The
//! fd is created here and closed by Wait before it returns.

use crate::last_errno;
use comux_core::error::{CoroError, CoroResult};
use std::os::unix::io::RawFd;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Create a one-shot monotonic timer fd that becomes readable after
/// `timeout_ns` nanoseconds.
///
/// `timeout_ns` must be positive: an all-zero expiry would disarm the
/// timer instead of firing it immediately.
pub fn oneshot(timeout_ns: i64) -> CoroResult<RawFd> {
    debug_assert!(timeout_ns > 0);

    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(CoroError::TimerSetupFailed(last_errno()));
    }

    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: (timeout_ns / NANOS_PER_SEC) as libc::time_t,
            tv_nsec: (timeout_ns % NANOS_PER_SEC) as libc::c_long,
        },
    };

    let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
    if rc != 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(CoroError::TimerSetupFailed(errno));
    }

    Ok(fd)
}

/// Close a timer fd handed out by [`oneshot`].
pub fn close(fd: RawFd) {
    if fd >= 0 {
        unsafe { libc::close(fd) };
    }
}
