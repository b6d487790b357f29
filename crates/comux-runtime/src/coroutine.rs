//! Coroutines: stackful, cooperatively scheduled execution contexts
//!
//! A coroutine owns its stack, its event fd and its published wait set.
//! Every suspension (yield, wait, sleep, call, yield_value, exit) saves
//! the coroutine's context and switches to the machine; a coroutine
//! never transfers directly to another coroutine.

use crate::arch::{self, Context};
use crate::event::EventFd;
use crate::machine::{CoroutineMachine, MachineCore, PollState};
use crate::stack::StackRegion;
use crate::timer;

use comux_core::error::{CoroError, CoroResult};
use comux_core::id::CoroId;
use comux_core::state::CoroState;
use comux_core::{cerror, cprintln, cwarn};

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

/// A coroutine body. Runs once; an `Err` terminates the coroutine as if
/// the body had returned, and is logged.
pub type CoroutineBody = Box<dyn FnOnce(&Coroutine) -> CoroResult<()> + 'static>;

/// Construction options collected by [`CoroutineBuilder`].
pub(crate) struct SpawnOptions {
    pub(crate) name: Option<String>,
    pub(crate) stack_size: Option<usize>,
    pub(crate) autostart: bool,
    pub(crate) user_data: *mut libc::c_void,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            name: None,
            stack_size: None,
            autostart: true,
            user_data: std::ptr::null_mut(),
        }
    }
}

/// Builder for coroutines that need something other than the defaults
/// (generated name, configured stack size, autostart on).
pub struct CoroutineBuilder {
    opts: SpawnOptions,
}

impl CoroutineBuilder {
    pub(crate) fn new() -> Self {
        Self {
            opts: SpawnOptions::default(),
        }
    }

    /// Debug label for the coroutine (default: `co-<id>`)
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.opts.name = Some(name.into());
        self
    }

    /// Stack size override in bytes (default: machine config)
    pub fn stack_size(mut self, size: usize) -> Self {
        self.opts.stack_size = Some(size);
        self
    }

    /// Whether the coroutine is started during construction
    /// (default: true)
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.opts.autostart = autostart;
        self
    }

    /// Opaque user pointer; never dereferenced, copied or freed by the
    /// runtime
    pub fn user_data(mut self, data: *mut libc::c_void) -> Self {
        self.opts.user_data = data;
        self
    }

    /// Register the coroutine with `machine` and hand back its handle.
    pub fn spawn<F>(self, machine: &CoroutineMachine, body: F) -> CoroResult<Rc<Coroutine>>
    where
        F: FnOnce(&Coroutine) -> CoroResult<()> + 'static,
    {
        machine.register(self.opts, Box::new(body))
    }
}

/// A stackful coroutine registered with a [`CoroutineMachine`].
///
/// Handles are `Rc`-shared: the machine keeps one strong reference per
/// live coroutine and drops it after the completion callback runs.
pub struct Coroutine {
    id: CoroId,
    name: RefCell<String>,
    machine: Weak<MachineCore>,
    weak_self: Weak<Coroutine>,

    state: Cell<CoroState>,
    stack: StackRegion,
    resume_ctx: UnsafeCell<Context>,
    exit_ctx: UnsafeCell<Context>,
    event: EventFd,

    /// Published wait set; non-empty exactly while Waiting
    wait_fds: RefCell<Vec<libc::pollfd>>,
    /// One-shot timer fd appended to the wait set, -1 if none
    timer_fd: Cell<RawFd>,
    /// What woke us: a wait fd, or a machine sentinel (timer/event)
    wake_fd: Cell<RawFd>,

    /// Back-reference to the caller while a Call is in flight
    caller: RefCell<Option<Weak<Coroutine>>>,
    /// Value produced by yield_value for the in-flight Call
    result_slot: RefCell<Option<Box<dyn Any>>>,
    /// A Call is in flight (bound together with `caller`)
    slot_bound: Cell<bool>,

    user_data: Cell<*mut libc::c_void>,
    last_tick: Cell<u64>,
    body: RefCell<Option<CoroutineBody>>,
}

impl Coroutine {
    /// Register a coroutine with default options (autostart on,
    /// configured stack size, generated name).
    pub fn new<F>(machine: &CoroutineMachine, body: F) -> CoroResult<Rc<Coroutine>>
    where
        F: FnOnce(&Coroutine) -> CoroResult<()> + 'static,
    {
        CoroutineBuilder::new().spawn(machine, body)
    }

    /// Builder for non-default construction.
    pub fn builder() -> CoroutineBuilder {
        CoroutineBuilder::new()
    }

    pub(crate) fn construct(
        machine: Weak<MachineCore>,
        id: CoroId,
        name: String,
        stack: StackRegion,
        event: EventFd,
        user_data: *mut libc::c_void,
        body: CoroutineBody,
    ) -> Rc<Coroutine> {
        Rc::new_cyclic(|weak_self| Coroutine {
            id,
            name: RefCell::new(name),
            machine,
            weak_self: weak_self.clone(),
            state: Cell::new(CoroState::New),
            stack,
            resume_ctx: UnsafeCell::new(Context::zeroed()),
            exit_ctx: UnsafeCell::new(Context::zeroed()),
            event,
            wait_fds: RefCell::new(Vec::new()),
            timer_fd: Cell::new(-1),
            wake_fd: Cell::new(-1),
            caller: RefCell::new(None),
            result_slot: RefCell::new(None),
            slot_bound: Cell::new(false),
            user_data: Cell::new(user_data),
            last_tick: Cell::new(0),
            body: RefCell::new(Some(body)),
        })
    }

    // ------------------------------------------------------------------
    // Identity and debug surface
    // ------------------------------------------------------------------

    /// Unique id, stable for the coroutine's lifetime
    #[inline]
    pub fn id(&self) -> CoroId {
        self.id
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> CoroState {
        self.state.get()
    }

    /// Debug label
    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// Change the debug label; legal at any time
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.borrow_mut() = name.into();
    }

    /// Opaque user pointer
    #[inline]
    pub fn user_data(&self) -> *mut libc::c_void {
        self.user_data.get()
    }

    /// Replace the opaque user pointer
    #[inline]
    pub fn set_user_data(&self, data: *mut libc::c_void) {
        self.user_data.set(data);
    }

    /// Machine tick at which this coroutine was last resumed
    #[inline]
    pub fn last_tick(&self) -> u64 {
        self.last_tick.get()
    }

    /// Handle to the owning machine, if it is still alive
    pub fn machine(&self) -> Option<CoroutineMachine> {
        self.machine.upgrade().map(CoroutineMachine::from_core)
    }

    /// True while the id is registered with the machine and the
    /// coroutine has not died.
    pub fn is_alive(&self) -> bool {
        match self.machine.upgrade() {
            Some(core) => core.id_registered(self.id) && self.state.get() != CoroState::Dead,
            None => false,
        }
    }

    /// Dump one line of state to stderr.
    pub fn show(&self) {
        cprintln!(
            "  [{}] {} state={} last_tick={}",
            self.id,
            self.name.borrow(),
            self.state.get(),
            self.last_tick.get()
        );
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Start a New coroutine: it becomes Ready and will get its first
    /// entry on an upcoming tick. Does not execute the body.
    pub fn start(&self) -> CoroResult<()> {
        let state = self.state.get();
        if state != CoroState::New {
            return Err(CoroError::invalid("start", state));
        }
        self.state.set(CoroState::Ready);
        Ok(())
    }

    /// Surrender control. The coroutine re-arms its own event fd, so it
    /// is runnable again on the next tick, after any less recently run
    /// candidates.
    pub fn yield_now(&self) -> CoroResult<()> {
        self.ensure_running("yield")?;
        self.state.set(CoroState::Yielded);
        self.event.trigger();
        self.suspend();
        Ok(())
    }

    /// Wait for one fd with the given poll event mask.
    ///
    /// Returns `Some(fd)` when the fd fired, `None` on timeout (or
    /// cancellation via the event fd). `timeout_ns <= 0` means no
    /// timeout.
    pub fn wait(&self, fd: RawFd, events: i16, timeout_ns: i64) -> CoroResult<Option<RawFd>> {
        let pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        self.wait_many(&[pfd], timeout_ns)
    }

    /// Wait for a single prepared pollfd.
    pub fn wait_poll(&self, pfd: libc::pollfd, timeout_ns: i64) -> CoroResult<Option<RawFd>> {
        self.wait_many(&[pfd], timeout_ns)
    }

    /// Wait for any of a set of pollfds, with an optional timeout.
    ///
    /// Returns the first fd (in list order) observed ready, or `None`
    /// if the timeout fired first. If the list contains duplicate fds,
    /// only the lowest-indexed fired entry is reported.
    pub fn wait_many(&self, fds: &[libc::pollfd], timeout_ns: i64) -> CoroResult<Option<RawFd>> {
        self.ensure_running("wait")?;

        let mut set: Vec<libc::pollfd> = fds
            .iter()
            .map(|p| libc::pollfd {
                fd: p.fd,
                events: p.events,
                revents: 0,
            })
            .collect();

        let mut timer_fd: RawFd = -1;
        if timeout_ns > 0 {
            match timer::oneshot(timeout_ns) {
                Ok(fd) => {
                    timer_fd = fd;
                    set.push(libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                }
                Err(e) => {
                    // Instant timeout: the wait degenerates to "timer
                    // already fired".
                    cwarn!("coroutine {}: {}", self.id, e);
                    return Ok(None);
                }
            }
        }

        if set.is_empty() {
            // Nothing to wait for and no timer (e.g. nanosleep(0)):
            // just give up the tick.
            self.yield_now()?;
            return Ok(None);
        }

        *self.wait_fds.borrow_mut() = set;
        self.timer_fd.set(timer_fd);
        self.state.set(CoroState::Waiting);
        self.suspend();
        self.end_of_wait(timer_fd)
    }

    fn end_of_wait(&self, timer_fd: RawFd) -> CoroResult<Option<RawFd>> {
        self.wait_fds.borrow_mut().clear();
        self.timer_fd.set(-1);
        if timer_fd >= 0 {
            timer::close(timer_fd);
        }
        let wake = self.wake_fd.get();
        if wake >= 0 && wake != timer_fd {
            Ok(Some(wake))
        } else {
            Ok(None)
        }
    }

    /// Sleep for `ns` nanoseconds. `nanosleep(0)` yields and returns
    /// promptly without creating a timer fd.
    pub fn nanosleep(&self, ns: i64) -> CoroResult<()> {
        self.wait_many(&[], ns).map(|_| ())
    }

    /// Sleep for `ms` milliseconds.
    pub fn millisleep(&self, ms: i64) -> CoroResult<()> {
        self.nanosleep(ms * 1_000_000)
    }

    /// Sleep for `secs` seconds.
    pub fn sleep(&self, secs: i64) -> CoroResult<()> {
        self.nanosleep(secs * 1_000_000_000)
    }

    /// Invoke another coroutine and wait for the value it produces with
    /// [`yield_value`](Self::yield_value).
    ///
    /// Binds the callee's caller back-reference for the duration of the
    /// call; a second caller gets `OverlappingCall`. A New callee is
    /// started, a suspended one is woken through its event fd; a callee
    /// parked in [`yield_value`](Self::yield_value) delivers its held
    /// value. If the callee dies without producing a value the call
    /// fails with `InvalidState`.
    pub fn call<T: Any>(&self, callee: &Rc<Coroutine>) -> CoroResult<T> {
        self.ensure_running("call")?;
        if callee.id == self.id {
            return Err(CoroError::invalid("call on self", self.state.get()));
        }
        if !callee.is_alive() {
            return Err(CoroError::invalid("call", callee.state.get()));
        }
        if callee.caller.borrow().is_some() {
            return Err(CoroError::OverlappingCall);
        }

        *callee.caller.borrow_mut() = Some(self.weak_self.clone());
        callee.slot_bound.set(true);
        *callee.result_slot.borrow_mut() = None;

        let start_result = if callee.state.get() == CoroState::New {
            callee.start()
        } else {
            callee.event.trigger();
            Ok(())
        };
        if let Err(e) = start_result {
            callee.slot_bound.set(false);
            *callee.caller.borrow_mut() = None;
            return Err(e);
        }

        self.state.set(CoroState::Yielded);
        self.suspend();

        // The callee produced a value (or died); unbind it.
        callee.slot_bound.set(false);
        *callee.caller.borrow_mut() = None;
        if callee.state.get() != CoroState::Dead {
            // Let the callee run on: it parks in its next yield_value
            // until the next call, or returns and dies.
            callee.event.trigger();
        }
        match callee.result_slot.borrow_mut().take() {
            Some(boxed) => boxed
                .downcast::<T>()
                .map(|b| *b)
                .map_err(|_| CoroError::ValueTypeMismatch),
            None => Err(CoroError::invalid("call", callee.state.get())),
        }
    }

    /// Produce a value for the Call bound to this coroutine and suspend
    /// until the next Call resumes it.
    ///
    /// If no call is in flight (the caller consumed the previous value
    /// and has not called again yet), the coroutine parks here and the
    /// value is delivered to whichever Call binds it next, so a
    /// consumer may freely suspend between calls.
    pub fn yield_value<T: Any>(&self, value: T) -> CoroResult<()> {
        self.ensure_running("yield_value")?;

        let mut pending = Some(value);
        loop {
            // The guard must not be held across a suspension: the next
            // caller rebinds `caller` while we are parked.
            let caller = self.caller.borrow().as_ref().and_then(Weak::upgrade);
            match caller {
                Some(caller) => {
                    if let Some(v) = pending.take() {
                        *self.result_slot.borrow_mut() = Some(Box::new(v));
                    }
                    caller.event.trigger();
                    self.state.set(CoroState::Yielded);
                    self.suspend();
                    return Ok(());
                }
                None => {
                    // No call in flight: park until one binds us.
                    self.state.set(CoroState::Yielded);
                    self.suspend();
                }
            }
        }
    }

    /// Cancel an in-flight Wait by triggering the coroutine's event fd.
    ///
    /// The cancelled Wait resumes with no wait fd fired and returns
    /// `None`. Triggering a Running coroutine is a no-op observable
    /// only after its next suspension; the event fd is always cleared
    /// before the body runs again.
    pub fn cancel_wait(&self) {
        self.event.trigger();
    }

    /// Terminate the coroutine immediately. Stack frames below the
    /// suspension point are abandoned without unwinding, so values on
    /// the coroutine stack are not dropped.
    ///
    /// Panics if called from anywhere but the running coroutine.
    pub fn exit(&self) -> ! {
        assert_eq!(
            self.state.get(),
            CoroState::Running,
            "exit called outside the running coroutine"
        );
        self.finish()
    }

    // ------------------------------------------------------------------
    // Machine-side plumbing
    // ------------------------------------------------------------------

    /// Contribute this coroutine's pollset entries: the event fd while
    /// suspended, plus the published wait set while Waiting.
    pub(crate) fn add_poll_fds(&self, ps: &mut PollState) {
        let state = self.state.get();
        if !state.is_suspended() {
            return;
        }
        let me = match self.weak_self.upgrade() {
            Some(me) => me,
            None => return,
        };

        ps.pollfds.push(self.event.pollfd());
        ps.owners.push(Some(me.clone()));

        if state == CoroState::Waiting {
            for pfd in self.wait_fds.borrow().iter() {
                ps.pollfds.push(libc::pollfd {
                    fd: pfd.fd,
                    events: pfd.events,
                    revents: 0,
                });
                ps.owners.push(Some(me.clone()));
            }
        }
    }

    pub(crate) fn event(&self) -> &EventFd {
        &self.event
    }

    pub(crate) fn timer_fd(&self) -> RawFd {
        self.timer_fd.get()
    }

    pub(crate) fn set_state(&self, state: CoroState) {
        self.state.set(state);
    }

    pub(crate) fn set_wake(&self, fd: RawFd) {
        self.wake_fd.set(fd);
    }

    pub(crate) fn set_last_tick(&self, tick: u64) {
        self.last_tick.set(tick);
    }

    pub(crate) fn resume_ctx_ptr(&self) -> *mut Context {
        self.resume_ctx.get()
    }

    pub(crate) fn stack_top(&self) -> *mut u8 {
        self.stack.top()
    }

    pub(crate) fn caller_rc(&self) -> Option<Rc<Coroutine>> {
        self.caller.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Run the body to completion, containing errors and panics: either
    /// terminates only this coroutine.
    pub(crate) fn invoke(&self) {
        let body = self.body.borrow_mut().take();
        if let Some(body) = body {
            match catch_unwind(AssertUnwindSafe(|| body(self))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    cwarn!(
                        "coroutine {} ({}) exited with error: {}",
                        self.id,
                        self.name.borrow(),
                        e
                    );
                }
                Err(_) => {
                    cerror!("coroutine {} ({}) panicked", self.id, self.name.borrow());
                }
            }
        }
    }

    /// Terminal transfer back to the machine. The outgoing context is
    /// saved into `exit_ctx` and never resumed.
    pub(crate) fn finish(&self) -> ! {
        self.state.set(CoroState::Dead);
        let core = self
            .machine
            .upgrade()
            .expect("machine must outlive a dying coroutine");
        unsafe { arch::switch(self.exit_ctx.get(), core.yield_ctx_ptr()) };
        unreachable!("dead coroutine resumed")
    }

    /// Save this coroutine's context and switch to the machine. Returns
    /// when the machine resumes us.
    fn suspend(&self) {
        let core = self
            .machine
            .upgrade()
            .expect("machine must outlive a suspended coroutine");
        unsafe { arch::switch(self.resume_ctx.get(), core.yield_ctx_ptr()) };
    }

    fn ensure_running(&self, op: &'static str) -> CoroResult<()> {
        let state = self.state.get();
        if state != CoroState::Running {
            return Err(CoroError::invalid(op, state));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn slot_is_bound(&self) -> bool {
        self.slot_bound.get()
    }

    #[cfg(test)]
    pub(crate) fn has_caller(&self) -> bool {
        self.caller.borrow().is_some()
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        // A coroutine dropped mid-Wait (e.g. after Stop) still owns its
        // pending timer fd.
        let t = self.timer_fd.get();
        if t >= 0 {
            timer::close(t);
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("name", &*self.name.borrow())
            .field("state", &self.state.get())
            .finish()
    }
}

/// First instruction of every coroutine, reached through the arch
/// trampoline. Never returns: `finish` switches away for good.
pub(crate) extern "C" fn coroutine_entry(arg: usize) {
    let co = unsafe { &*(arg as *const Coroutine) };
    co.invoke();
    co.finish()
}
