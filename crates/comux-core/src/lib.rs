//! # comux-core
//!
//! Core types for the comux coroutine machine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The machine, context switching and fd plumbing live in `comux-runtime`.
//!
//! ## Modules
//!
//! - `id` - coroutine identifier type
//! - `state` - coroutine lifecycle states
//! - `bitmap` - dense id bitmap with smallest-free allocation
//! - `error` - error types
//! - `cprint` - leveled stderr print macros
//! - `env` - environment variable utilities

pub mod bitmap;
pub mod cprint;
pub mod env;
pub mod error;
pub mod id;
pub mod state;

// Re-exports for convenience
pub use bitmap::IdBitmap;
pub use env::{env_get, env_get_bool};
pub use error::{CoroError, CoroResult};
pub use id::CoroId;
pub use state::CoroState;

/// Runtime-wide constants
pub mod constants {
    /// Default coroutine stack size (32 KiB)
    pub const DEFAULT_STACK_SIZE: usize = 32 * 1024;

    /// Default ceiling on live coroutine ids
    pub const DEFAULT_MAX_COROUTINES: u32 = 4096;

    /// Guard page size below each stack (one page)
    pub const GUARD_SIZE: usize = 4096;
}
