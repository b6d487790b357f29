//! x86_64 context switching
//!
//! Hand-written save/restore of the SysV AMD64 callee-saved register set
//! using naked functions (stable in Rust 1.88+).

use std::arch::naked_asm;

/// Saved execution context: stack pointer, resume address and the
/// callee-saved registers of the SysV AMD64 ABI.
///
/// The assembly below addresses fields by byte offset; the layout must
/// not change.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    rsp: u64, // 0x00
    rip: u64, // 0x08
    rbx: u64, // 0x10
    rbp: u64, // 0x18
    r12: u64, // 0x20
    r13: u64, // 0x28
    r14: u64, // 0x30
    r15: u64, // 0x38
}

impl Context {
    /// An all-zero context, only valid as a save target.
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare `ctx` so that the first switch into it begins `entry(arg)`
/// with the stack pointer at the top of the given region.
///
/// `entry` must never return; the trampoline traps if it does.
///
/// # Safety
///
/// `stack_top` must be the one-past-the-end address of a mapped,
/// writable region that stays valid for the lifetime of the context.
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry: extern "C" fn(usize),
    arg: usize,
) {
    // The trampoline is entered by `jmp` with rsp 16-byte aligned; its
    // `call` then hands the entry function a conforming frame (rsp ≡ 8
    // mod 16 at entry, as after a normal call).
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First-entry trampoline: calls the entry function stored in r12 with
/// the argument stored in r13.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // The entry function must switch away instead of returning.
        "ud2",
    );
}

/// Save the current execution context into `save` and resume `resume`.
///
/// Returns when a later switch resumes `save`. A saved context may be
/// resumed at most once before being saved again.
///
/// # Safety
///
/// `resume` must hold a context prepared by `init_context` or saved by a
/// previous `switch`, and must not have been resumed since.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_save: *mut Context, _resume: *const Context) {
    naked_asm!(
        // Save callee-saved state into *rdi.
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load the target context from *rsi.
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context.
        "1:",
        "ret",
    );
}
