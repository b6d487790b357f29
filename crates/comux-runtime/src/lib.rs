//! # comux-runtime
//!
//! The comux coroutine machine: a single-threaded cooperative scheduler
//! multiplexing stackful coroutines over one poll(2) loop.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Stack regions (mmap with guard pages)
//! - Per-coroutine event fds and one-shot timer fds
//! - The `Coroutine` and `CoroutineMachine` types

pub mod arch;
pub mod config;
pub mod coroutine;
pub mod event;
pub mod machine;
pub mod stack;
pub mod timer;

// Re-exports
pub use config::MachineConfig;
pub use coroutine::{Coroutine, CoroutineBuilder};
pub use event::EventFd;
pub use machine::{CoroutineMachine, PollState};

// The event and timer fds are Linux primitives; the readiness loop is
// plain POSIX poll(2).
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // supported
    } else {
        compile_error!("Unsupported platform: comux needs eventfd and timerfd");
    }
}

/// Errno of the most recent failed syscall on this thread.
#[inline]
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
