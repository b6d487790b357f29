//! Architecture-specific context switching
//!
//! Each architecture module provides the same three items: a `Context`
//! register block, `switch` (save the current context, resume another)
//! and `init_context` (prepare a context that begins `entry(arg)` on a
//! fresh stack). All scheduling is built on these primitives.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{Context, init_context, switch};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{Context, init_context, switch};
    } else {
        compile_error!("Unsupported architecture");
    }
}
