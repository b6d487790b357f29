//! # comux - cooperative coroutine machine
//!
//! A single-threaded coroutine runtime for POSIX-like systems. Each
//! coroutine is a stackful execution context that surrenders control at
//! explicit points: yield, waiting on file descriptors (with optional
//! timeout), sleeping, or calling another coroutine and awaiting the
//! value it produces. One machine multiplexes all of them over a single
//! poll(2) loop, so one OS thread hosts many concurrent I/O-bound
//! activities without kernel threads.
//!
//! ## Quick Start
//!
//! ```ignore
//! use comux::{Coroutine, CoroutineMachine};
//!
//! fn main() -> comux::CoroResult<()> {
//!     let machine = CoroutineMachine::new()?;
//!
//!     Coroutine::new(&machine, |co| {
//!         for i in 0..3 {
//!             println!("hello {}", i);
//!             co.yield_now()?;
//!         }
//!         Ok(())
//!     })?;
//!
//!     Coroutine::new(&machine, |co| {
//!         co.millisleep(10)?;
//!         println!("slept 10ms");
//!         Ok(())
//!     })?;
//!
//!     machine.run()
//! }
//! ```
//!
//! ## Call / yield_value
//!
//! A coroutine can invoke another and receive a typed value:
//!
//! ```ignore
//! let generator = Coroutine::builder()
//!     .autostart(false)
//!     .spawn(&machine, |co| {
//!         for i in 1..=10i32 {
//!             co.yield_value(i)?;
//!         }
//!         Ok(())
//!     })?;
//!
//! Coroutine::new(&machine, move |co| {
//!     let first: i32 = co.call(&generator)?;
//!     assert_eq!(first, 1);
//!     Ok(())
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     User Code                          │
//! │     Coroutine::new, yield_now, wait, call, sleep       │
//! └────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                  CoroutineMachine                      │
//! │   fused pollset · fair selection · one resume per tick │
//! └────────────────────────────────────────────────────────┘
//!            │                 │                 │
//!            ▼                 ▼                 ▼
//!      ┌──────────┐      ┌──────────┐      ┌──────────┐
//!      │ event fd │      │ timer fd │      │ wait fds │
//!      └──────────┘      └──────────┘      └──────────┘
//!                           │
//!                           ▼
//! ┌────────────────────────────────────────────────────────┐
//! │          per-coroutine stacks (mmap + guard)           │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! A host event loop can also drive the machine without `run`: fill a
//! [`PollState`] with [`CoroutineMachine::get_poll_state`], poll it
//! yourself, and hand it back to [`CoroutineMachine::process_poll`] for
//! exactly one scheduling step.

// Re-export core types
pub use comux_core::{CoroError, CoroId, CoroResult, CoroState};

// Re-export the print macros and their controls
pub use comux_core::cprint::{self, set_flush_enabled, set_log_level, LogLevel};
pub use comux_core::{cdebug, cerror, cinfo, cprintln, ctrace, cwarn};

// Re-export env utilities
pub use comux_core::{env_get, env_get_bool};

// Re-export runtime types
pub use comux_runtime::{
    Coroutine, CoroutineBuilder, CoroutineMachine, EventFd, MachineConfig, PollState,
};
