//! The coroutine machine
//!
//! Owns every live coroutine and drives the tick loop: fuse the wait
//! descriptors of all suspended coroutines plus the machine's interrupt
//! fd into one pollset, poll, pick the least recently run woken
//! candidate, resume it, and reap it if it died. Exactly one coroutine
//! is resumed per tick; remaining candidates are observed again on the
//! next tick (poll is level-triggered).

use crate::arch::{self, Context};
use crate::config::MachineConfig;
use crate::coroutine::{coroutine_entry, Coroutine, CoroutineBody, SpawnOptions};
use crate::event::EventFd;
use crate::last_errno;
use crate::stack::StackRegion;

use comux_core::bitmap::IdBitmap;
use comux_core::error::{CoroError, CoroResult};
use comux_core::id::CoroId;
use comux_core::state::CoroState;
use comux_core::{cdebug, cprintln, ctrace};

use std::cell::{Cell, RefCell, UnsafeCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Selection sentinel: woken through the event fd (or first entry of a
/// Ready coroutine). A Wait resumed with this reports cancellation.
pub(crate) const EVENT_WAKE: RawFd = -2;

/// Selection sentinel: the wait's timer fd fired.
pub(crate) const TIMEOUT_WAKE: RawFd = -1;

/// Completion callback: invoked exactly once per coroutine, immediately
/// after its body returns or Exit is called, before its id is freed.
/// The callback may drop its handle or register new coroutines.
pub type CompletionCallback = Box<dyn FnMut(&Rc<Coroutine>)>;

/// The fused pollset for one tick, with the owning coroutine of each
/// entry aligned by index. A `None` owner marks the machine's own
/// interrupt fd.
///
/// Used by the embedded mode: fill it with [`CoroutineMachine::get_poll_state`],
/// run your own poll over `pollfds`, then hand it back to
/// [`CoroutineMachine::process_poll`].
pub struct PollState {
    pub pollfds: Vec<libc::pollfd>,
    pub owners: Vec<Option<Rc<Coroutine>>>,
}

impl PollState {
    pub fn new() -> Self {
        Self {
            pollfds: Vec::new(),
            owners: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.pollfds.clear();
        self.owners.clear();
    }
}

impl Default for PollState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared machine state; coroutines reach it through a weak reference.
pub(crate) struct MachineCore {
    registry: RefCell<Vec<Rc<Coroutine>>>,
    ids: RefCell<IdBitmap>,
    tick: Cell<u64>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    /// Wakes an in-flight poll when Stop is called
    interrupt: EventFd,
    /// The machine's saved context; every suspension jumps here
    yield_ctx: UnsafeCell<Context>,
    poll_cache: RefCell<PollState>,
    completion: RefCell<Option<CompletionCallback>>,
    config: MachineConfig,
}

impl MachineCore {
    pub(crate) fn yield_ctx_ptr(&self) -> *mut Context {
        self.yield_ctx.get()
    }

    pub(crate) fn id_registered(&self, id: CoroId) -> bool {
        self.ids.borrow().contains(id)
    }
}

/// The single-threaded cooperative scheduler.
///
/// Cheap to clone: clones share the same machine.
#[derive(Clone)]
pub struct CoroutineMachine {
    core: Rc<MachineCore>,
}

impl CoroutineMachine {
    /// Create a machine with configuration from the environment.
    pub fn new() -> CoroResult<Self> {
        Self::with_config(MachineConfig::from_env())
    }

    /// Create a machine with an explicit configuration.
    pub fn with_config(config: MachineConfig) -> CoroResult<Self> {
        config.validate().expect("invalid machine configuration");
        Ok(Self {
            core: Rc::new(MachineCore {
                registry: RefCell::new(Vec::new()),
                ids: RefCell::new(IdBitmap::new(config.max_coroutines)),
                tick: Cell::new(0),
                running: Cell::new(false),
                stop_requested: Cell::new(false),
                interrupt: EventFd::new()?,
                yield_ctx: UnsafeCell::new(Context::zeroed()),
                poll_cache: RefCell::new(PollState::new()),
                completion: RefCell::new(None),
                config,
            }),
        })
    }

    pub(crate) fn from_core(core: Rc<MachineCore>) -> Self {
        Self { core }
    }

    /// Register a new coroutine. Called by `Coroutine::new` and
    /// `CoroutineBuilder::spawn`.
    pub(crate) fn register(
        &self,
        opts: SpawnOptions,
        body: CoroutineBody,
    ) -> CoroResult<Rc<Coroutine>> {
        let core = &self.core;
        let id = core
            .ids
            .borrow_mut()
            .allocate()
            .ok_or(CoroError::IdExhausted)?;

        let stack_size = opts.stack_size.unwrap_or(core.config.default_stack_size);
        let stack = match StackRegion::new(stack_size) {
            Ok(s) => s,
            Err(e) => {
                core.ids.borrow_mut().free(id);
                return Err(e);
            }
        };
        let event = match EventFd::new() {
            Ok(ev) => ev,
            Err(e) => {
                core.ids.borrow_mut().free(id);
                return Err(e);
            }
        };

        let name = opts.name.unwrap_or_else(|| format!("co-{}", id));
        let co = Coroutine::construct(
            Rc::downgrade(core),
            id,
            name,
            stack,
            event,
            opts.user_data,
            body,
        );
        core.registry.borrow_mut().push(co.clone());
        cdebug!("registered coroutine {} ({})", co.id(), co.name());

        if opts.autostart {
            co.start()?;
        }
        Ok(co)
    }

    /// Place a New coroutine into the Ready pool for the next tick.
    pub fn start_coroutine(&self, co: &Rc<Coroutine>) -> CoroResult<()> {
        co.start()
    }

    /// Deregister a coroutine and free its id.
    ///
    /// Intended for coroutines that never started or that already died
    /// and were kept alive by the completion callback; detaching a
    /// started, live coroutine breaks the machine's invariants.
    pub fn remove_coroutine(&self, co: &Rc<Coroutine>) {
        self.core
            .registry
            .borrow_mut()
            .retain(|c| !Rc::ptr_eq(c, co));
        self.core.ids.borrow_mut().free(co.id());
    }

    /// Install the completion callback. Replaces any previous one.
    pub fn set_completion_callback<F>(&self, cb: F)
    where
        F: FnMut(&Rc<Coroutine>) + 'static,
    {
        *self.core.completion.borrow_mut() = Some(Box::new(cb));
    }

    /// Drive the machine until `stop` is called or no coroutine is
    /// Ready, Yielded or Waiting.
    pub fn run(&self) -> CoroResult<()> {
        if self.core.running.replace(true) {
            return Err(CoroError::invalid("run", CoroState::Running));
        }
        self.core.stop_requested.set(false);
        // A previous Stop may have left the interrupt fd readable (the
        // loop can exit through the nothing-schedulable check without
        // polling); stale readability would make every blocking poll
        // return immediately.
        self.core.interrupt.clear();
        let result = self.run_loop();
        self.core.poll_cache.borrow_mut().reset();
        self.core.running.set(false);
        result
    }

    /// Ask a running machine to return from `run` promptly. Running and
    /// suspended coroutines are left exactly as they are.
    pub fn stop(&self) {
        self.core.stop_requested.set(true);
        self.core.interrupt.trigger();
    }

    /// True while `run` is on the stack.
    pub fn is_running(&self) -> bool {
        self.core.running.get()
    }

    /// Monotonic tick counter.
    pub fn tick_count(&self) -> u64 {
        self.core.tick.get()
    }

    /// Number of registered coroutines.
    pub fn coroutine_count(&self) -> usize {
        self.core.registry.borrow().len()
    }

    /// True if any coroutine is Ready (a host poll should not block).
    pub fn has_ready(&self) -> bool {
        self.core
            .registry
            .borrow()
            .iter()
            .any(|c| c.state() == CoroState::Ready)
    }

    /// Embedded mode, step one: advance the tick and fill `out` with
    /// the exact pollset the run loop would submit this tick.
    pub fn get_poll_state(&self, out: &mut PollState) {
        self.core.tick.set(self.core.tick.get() + 1);
        self.build_poll_fds(out);
    }

    /// Embedded mode, step two: consume a caller-polled pollset and
    /// perform exactly one scheduling step (select, resume, reap).
    ///
    /// Must be driven from the host loop, never from a coroutine body:
    /// a nested scheduling step would clobber the machine's saved
    /// context.
    pub fn process_poll(&self, ps: &PollState) -> CoroResult<()> {
        if self.core.running.replace(true) {
            return Err(CoroError::invalid("process_poll", CoroState::Running));
        }
        if let Some((co, fd)) = self.choose_runnable(ps) {
            self.step(&co, fd);
        }
        self.core.running.set(false);
        Ok(())
    }

    /// Dump the machine and every registered coroutine to stderr.
    pub fn show(&self) {
        cprintln!(
            "machine: {} coroutines, tick {}",
            self.coroutine_count(),
            self.tick_count()
        );
        for co in self.core.registry.borrow().iter() {
            co.show();
        }
    }

    // ------------------------------------------------------------------
    // Run loop internals
    // ------------------------------------------------------------------

    fn run_loop(&self) -> CoroResult<()> {
        let core = &self.core;
        loop {
            if !self.has_schedulable() {
                return Ok(());
            }
            core.tick.set(core.tick.get() + 1);

            let chosen = {
                let mut ps = core.poll_cache.borrow_mut();
                self.build_poll_fds(&mut ps);

                // Ready coroutines are runnable without any fd firing,
                // so only probe; otherwise block until something wakes.
                let timeout = if self.has_ready() { 0 } else { -1 };
                loop {
                    let rc = unsafe {
                        libc::poll(
                            ps.pollfds.as_mut_ptr(),
                            ps.pollfds.len() as libc::nfds_t,
                            timeout,
                        )
                    };
                    if rc >= 0 {
                        break;
                    }
                    let errno = last_errno();
                    if errno != libc::EINTR {
                        return Err(CoroError::PollFailed(errno));
                    }
                    // EINTR retried silently
                }

                if core.stop_requested.get() {
                    core.interrupt.clear();
                    return Ok(());
                }

                self.choose_runnable(&ps)
            };

            if let Some((co, fd)) = chosen {
                self.step(&co, fd);
            }
        }
    }

    fn has_schedulable(&self) -> bool {
        self.core
            .registry
            .borrow()
            .iter()
            .any(|c| c.state().is_schedulable())
    }

    /// Build the fused pollset: the interrupt fd first, then every
    /// suspended coroutine's entries.
    fn build_poll_fds(&self, ps: &mut PollState) {
        ps.reset();
        ps.pollfds.push(self.core.interrupt.pollfd());
        ps.owners.push(None);

        for co in self.core.registry.borrow().iter() {
            co.add_poll_fds(ps);
        }
    }

    /// Select the next runnable coroutine and the fd that woke it.
    ///
    /// Candidates are every Ready coroutine plus every suspended
    /// coroutine with a fired pollset entry. Selection is fair by least
    /// recently run (smallest `last_tick`), ties broken by smallest id.
    fn choose_runnable(&self, ps: &PollState) -> Option<(Rc<Coroutine>, RawFd)> {
        fn offer(
            best: &mut Option<(u64, u32, Rc<Coroutine>, RawFd)>,
            co: &Rc<Coroutine>,
            fd: RawFd,
        ) {
            let key = (co.last_tick(), co.id().as_u32());
            let replace = match best {
                None => true,
                Some((tick, id, _, _)) => key < (*tick, *id),
            };
            if replace {
                *best = Some((key.0, key.1, co.clone(), fd));
            }
        }

        let mut best: Option<(u64, u32, Rc<Coroutine>, RawFd)> = None;

        // Poll-driven candidates. A coroutine's entries are contiguous
        // and ordered (event fd, then wait fds in list order, timer
        // last); the first fired entry decides the wake fd, so a real
        // wait fd is reported by its lowest index and a timer-only wake
        // maps to timeout.
        let mut idx = 0;
        while idx < ps.pollfds.len() {
            let owner = match &ps.owners[idx] {
                Some(o) => o.clone(),
                None => {
                    idx += 1;
                    continue;
                }
            };
            let start = idx;
            while idx < ps.pollfds.len()
                && ps.owners[idx].as_ref().map(|c| c.id()) == Some(owner.id())
            {
                idx += 1;
            }
            if !owner.state().is_suspended() {
                continue; // stale entry from a host-held pollset
            }
            for i in start..idx {
                if ps.pollfds[i].revents != 0 {
                    let fd = ps.pollfds[i].fd;
                    let wake = if fd == owner.event().fd() {
                        EVENT_WAKE
                    } else if fd == owner.timer_fd() {
                        TIMEOUT_WAKE
                    } else {
                        fd
                    };
                    offer(&mut best, &owner, wake);
                    break;
                }
            }
        }

        // Ready coroutines don't appear in the pollset.
        for co in self.core.registry.borrow().iter() {
            if co.state() == CoroState::Ready {
                offer(&mut best, co, EVENT_WAKE);
            }
        }

        best.map(|(_, _, co, fd)| (co, fd))
    }

    /// Resume one coroutine and handle its death (run loop steps 5-6).
    fn step(&self, co: &Rc<Coroutine>, fd: RawFd) {
        let core = &self.core;
        ctrace!(
            "tick {}: resume coroutine {} (wake fd {})",
            core.tick.get(),
            co.id(),
            fd
        );

        // The one-shot wake is consumed here: the event fd is always
        // clear when the body runs again.
        co.event().clear();
        co.set_wake(fd);
        co.set_last_tick(core.tick.get());

        // A coroutine observed in Ready has never run (resumes from
        // suspension go Yielded/Waiting straight back to Running), so
        // Ready means "enter on a fresh stack".
        let first_entry = co.state() == CoroState::Ready;
        co.set_state(CoroState::Running);

        unsafe {
            if first_entry {
                arch::init_context(
                    co.resume_ctx_ptr(),
                    co.stack_top(),
                    coroutine_entry,
                    Rc::as_ptr(co) as usize,
                );
            }
            arch::switch(core.yield_ctx_ptr(), co.resume_ctx_ptr());
        }

        // Back on the machine stack: the coroutine suspended or died.
        if co.state() == CoroState::Dead {
            self.reap(co);
        }
    }

    /// Completion handling: wake a bound caller, run the callback, then
    /// detach the coroutine and free its id.
    fn reap(&self, co: &Rc<Coroutine>) {
        let core = &self.core;
        cdebug!("coroutine {} ({}) finished", co.id(), co.name());

        if let Some(caller) = co.caller_rc() {
            // The in-flight Call resumes and observes the empty slot.
            caller.event().trigger();
        }

        // Taken out of the cell, with the borrow released, so the
        // callback may itself register coroutines or replace the
        // callback.
        let taken = core.completion.borrow_mut().take();
        if let Some(mut cb) = taken {
            cb(co);
            let mut slot = core.completion.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }

        core.registry.borrow_mut().retain(|c| !Rc::ptr_eq(c, co));
        core.ids.borrow_mut().free(co.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::time::{Duration, Instant};

    fn machine() -> CoroutineMachine {
        CoroutineMachine::new().unwrap()
    }

    fn pipe2() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    #[test]
    fn test_run_with_no_started_coroutines_returns() {
        let m = machine();
        let co = Coroutine::builder()
            .autostart(false)
            .spawn(&m, |_| Ok(()))
            .unwrap();
        m.run().unwrap();
        assert_eq!(co.state(), CoroState::New);
        assert!(co.is_alive());
    }

    #[test]
    fn test_ping_pong_yield_counts() {
        let m = machine();
        let resumes = Rc::new(Cell::new(0u32));
        let completed = Rc::new(Cell::new(0u32));
        {
            let completed = completed.clone();
            m.set_completion_callback(move |_| completed.set(completed.get() + 1));
        }
        for _ in 0..2 {
            let resumes = resumes.clone();
            Coroutine::new(&m, move |co| {
                for _ in 0..1000 {
                    resumes.set(resumes.get() + 1);
                    co.yield_now()?;
                }
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert_eq!(resumes.get(), 2000);
        assert_eq!(completed.get(), 2);
        assert_eq!(m.coroutine_count(), 0);
    }

    #[test]
    fn test_yielders_strictly_alternate() {
        let m = machine();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..2u32 {
            let order = order.clone();
            Coroutine::new(&m, move |co| {
                for _ in 0..50 {
                    order.borrow_mut().push(tag);
                    co.yield_now()?;
                }
                Ok(())
            })
            .unwrap();
        }
        m.run().unwrap();

        let order = order.borrow();
        assert_eq!(order.len(), 100);
        for pair in order.windows(2) {
            assert_ne!(pair[0], pair[1], "a yielder ran twice in a row");
        }
    }

    #[test]
    fn test_producer_consumer_call() {
        let m = machine();
        let producer = Coroutine::builder()
            .autostart(false)
            .name("producer")
            .spawn(&m, |co| {
                for i in 1..=10i32 {
                    co.yield_value(i)?;
                }
                Ok(())
            })
            .unwrap();

        let got = Rc::new(RefCell::new(Vec::new()));
        let eleventh = Rc::new(RefCell::new(None));
        {
            let got = got.clone();
            let eleventh = eleventh.clone();
            let producer = producer.clone();
            Coroutine::new(&m, move |co| {
                for _ in 0..10 {
                    got.borrow_mut().push(co.call::<i32>(&producer)?);
                }
                *eleventh.borrow_mut() = Some(co.call::<i32>(&producer));
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert_eq!(*got.borrow(), (1..=10).collect::<Vec<_>>());
        assert!(matches!(
            *eleventh.borrow(),
            Some(Err(CoroError::InvalidState { .. }))
        ));
        assert!(!producer.is_alive());
    }

    #[test]
    fn test_call_before_start() {
        let m = machine();
        let callee = Coroutine::builder()
            .autostart(false)
            .spawn(&m, |co| {
                co.yield_value(42u64)?;
                Ok(())
            })
            .unwrap();

        let got = Rc::new(Cell::new(0u64));
        {
            let got = got.clone();
            let callee = callee.clone();
            Coroutine::new(&m, move |co| {
                got.set(co.call::<u64>(&callee)?);
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert_eq!(got.get(), 42);
        assert!(!callee.is_alive());
        assert_eq!(m.coroutine_count(), 0);
    }

    #[test]
    fn test_call_transfers_exact_value() {
        #[derive(Debug, Clone, Copy, PartialEq)]
        struct Sample {
            a: u64,
            b: u64,
            c: u32,
        }
        let sample = Sample {
            a: 0xDEAD_BEEF_CAFE_F00D,
            b: u64::MAX,
            c: 0x1234_5678,
        };

        let m = machine();
        let callee = Coroutine::builder()
            .autostart(false)
            .spawn(&m, move |co| {
                co.yield_value(sample)?;
                Ok(())
            })
            .unwrap();

        let got = Rc::new(RefCell::new(None));
        {
            let got = got.clone();
            let callee = callee.clone();
            Coroutine::new(&m, move |co| {
                *got.borrow_mut() = Some(co.call::<Sample>(&callee)?);
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert_eq!(got.borrow().unwrap(), sample);
    }

    #[test]
    fn test_call_wrong_type_is_mismatch() {
        let m = machine();
        let callee = Coroutine::builder()
            .autostart(false)
            .spawn(&m, |co| {
                co.yield_value(7u32)?;
                Ok(())
            })
            .unwrap();

        let outcome = Rc::new(RefCell::new(None));
        {
            let outcome = outcome.clone();
            let callee = callee.clone();
            Coroutine::new(&m, move |co| {
                *outcome.borrow_mut() = Some(co.call::<u64>(&callee));
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert!(matches!(
            *outcome.borrow(),
            Some(Err(CoroError::ValueTypeMismatch))
        ));
    }

    #[test]
    fn test_overlapping_call_fails_second_caller() {
        let m = machine();
        let callee = Coroutine::builder()
            .autostart(false)
            .spawn(&m, |co| {
                co.millisleep(50)?;
                co.yield_value(1i32)?;
                Ok(())
            })
            .unwrap();

        let first = Rc::new(RefCell::new(None));
        let second = Rc::new(RefCell::new(None));
        {
            let first = first.clone();
            let callee = callee.clone();
            Coroutine::new(&m, move |co| {
                *first.borrow_mut() = Some(co.call::<i32>(&callee));
                Ok(())
            })
            .unwrap();
        }
        {
            let second = second.clone();
            let callee = callee.clone();
            Coroutine::new(&m, move |co| {
                // The first call is parked in the callee's sleep.
                co.millisleep(5)?;
                *second.borrow_mut() = Some(co.call::<i32>(&callee));
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert!(matches!(*first.borrow(), Some(Ok(1))));
        assert!(matches!(
            *second.borrow(),
            Some(Err(CoroError::OverlappingCall))
        ));
    }

    #[test]
    fn test_yield_value_parks_until_called() {
        let m = machine();
        // Started with no call in flight: the first yield_value parks
        // and the value is delivered to the call that arrives later.
        let producer = Coroutine::new(&m, |co| {
            co.yield_value(5i32)?;
            Ok(())
        })
        .unwrap();

        let got = Rc::new(Cell::new(0i32));
        {
            let got = got.clone();
            let producer = producer.clone();
            Coroutine::new(&m, move |co| {
                co.millisleep(2)?; // let the producer park first
                got.set(co.call::<i32>(&producer)?);
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert_eq!(got.get(), 5);
        assert!(!producer.is_alive());
    }

    #[test]
    fn test_generator_survives_consumer_suspension() {
        let m = machine();
        let producer = Coroutine::builder()
            .autostart(false)
            .spawn(&m, |co| {
                for i in 1..=3i32 {
                    co.yield_value(i)?;
                }
                Ok(())
            })
            .unwrap();

        let got = Rc::new(RefCell::new(Vec::new()));
        {
            let got = got.clone();
            let producer = producer.clone();
            Coroutine::new(&m, move |co| {
                // Suspending between calls must not derail the
                // generator or drop a value.
                for _ in 0..3 {
                    got.borrow_mut().push(co.call::<i32>(&producer)?);
                    co.millisleep(2)?;
                }
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert_eq!(*got.borrow(), vec![1, 2, 3]);
        assert!(!producer.is_alive());
    }

    #[test]
    fn test_wait_timeout_only() {
        let m = machine();
        let (r, w) = pipe2();
        let out = Rc::new(RefCell::new(None));
        {
            let out = out.clone();
            Coroutine::new(&m, move |co| {
                let start = Instant::now();
                let res = co.wait(r, libc::POLLIN, 10_000_000)?; // 10 ms
                *out.borrow_mut() = Some((res, start.elapsed()));
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        let (res, elapsed) = out.borrow().unwrap();
        assert_eq!(res, None);
        assert!(elapsed >= Duration::from_millis(10));
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_readiness_beats_timeout() {
        let m = machine();
        let (r, w) = pipe2();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            let byte = [1u8];
            unsafe { libc::write(w, byte.as_ptr() as *const libc::c_void, 1) };
        });

        let out = Rc::new(RefCell::new(None));
        {
            let out = out.clone();
            Coroutine::new(&m, move |co| {
                let start = Instant::now();
                let res = co.wait(r, libc::POLLIN, 1_000_000_000)?; // 1 s
                *out.borrow_mut() = Some((res, start.elapsed()));
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        writer.join().unwrap();
        let (res, elapsed) = out.borrow().unwrap();
        assert_eq!(res, Some(r));
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(500));
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_wait_reports_lowest_indexed_ready_fd() {
        let m = machine();
        let (r1, w1) = pipe2();
        let (r2, w2) = pipe2();
        // Both pipes readable before the wait even starts.
        for w in [w1, w2] {
            let byte = [1u8];
            unsafe { libc::write(w, byte.as_ptr() as *const libc::c_void, 1) };
        }

        let out = Rc::new(Cell::new(-1 as RawFd));
        {
            let out = out.clone();
            Coroutine::new(&m, move |co| {
                let fds = [
                    libc::pollfd {
                        fd: r2,
                        events: libc::POLLIN,
                        revents: 0,
                    },
                    libc::pollfd {
                        fd: r1,
                        events: libc::POLLIN,
                        revents: 0,
                    },
                ];
                if let Some(fd) = co.wait_many(&fds, 0)? {
                    out.set(fd);
                }
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        // r2 is first in list order, so it wins the tie.
        assert_eq!(out.get(), r2);
        for fd in [r1, w1, r2, w2] {
            close_fd(fd);
        }
    }

    #[test]
    fn test_nanosleep_zero_returns_promptly() {
        let m = machine();
        let before = open_fd_count();
        let start = Instant::now();
        Coroutine::new(&m, |co| co.nanosleep(0)).unwrap();
        m.run().unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(open_fd_count(), before);
    }

    #[test]
    fn test_wait_timeout_closes_timer_fd() {
        let m = machine();
        let before = open_fd_count();
        Coroutine::new(&m, |co| co.millisleep(5)).unwrap();
        m.run().unwrap();
        // Timer fd, event fd and stack of the dead coroutine are gone.
        assert_eq!(open_fd_count(), before);
    }

    #[test]
    fn test_cancel_wait_returns_none() {
        let m = machine();
        let (r, w) = pipe2();
        let observed: Rc<RefCell<Option<Option<RawFd>>>> = Rc::new(RefCell::new(None));
        let waiter = {
            let observed = observed.clone();
            Coroutine::builder()
                .name("waiter")
                .spawn(&m, move |co| {
                    // No writer and no timeout: only cancellation ends
                    // this wait.
                    *observed.borrow_mut() = Some(co.wait(r, libc::POLLIN, 0)?);
                    Ok(())
                })
                .unwrap()
        };
        {
            let waiter = waiter.clone();
            Coroutine::new(&m, move |co| {
                co.millisleep(5)?;
                waiter.cancel_wait();
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert_eq!(*observed.borrow(), Some(None));
        assert_eq!(m.coroutine_count(), 0);
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_stop_leaves_sleepers_suspended() {
        let m = machine();
        let mut sleepers = Vec::new();
        for _ in 0..3 {
            sleepers.push(Coroutine::new(&m, |co| co.sleep(1)).unwrap());
        }
        Coroutine::new(&m, |co| {
            co.millisleep(10)?;
            co.machine().unwrap().stop();
            Ok(())
        })
        .unwrap();

        let start = Instant::now();
        m.run().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        for s in &sleepers {
            assert!(s.is_alive());
            assert_eq!(s.state(), CoroState::Waiting);
        }
    }

    #[test]
    fn test_run_after_stop_blocks_again() {
        let m = machine();
        // Stop with nothing else schedulable: the loop exits through
        // the nothing-schedulable check without draining the interrupt.
        Coroutine::new(&m, |co| {
            co.machine().unwrap().stop();
            Ok(())
        })
        .unwrap();
        m.run().unwrap();

        // The next run must block in poll again rather than spin on
        // the stale interrupt: a handful of ticks, not thousands.
        let (r, w) = pipe2();
        let ticks_before = m.tick_count();
        Coroutine::new(&m, move |co| {
            co.wait(r, libc::POLLIN, 10_000_000).map(|_| ()) // 10 ms
        })
        .unwrap();
        m.run().unwrap();
        assert!(m.tick_count() - ticks_before <= 10);
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_completion_callback_may_spawn() {
        let m = machine();
        let completed = Rc::new(Cell::new(0u32));
        let chained = Rc::new(Cell::new(false));
        {
            let completed = completed.clone();
            let chained = chained.clone();
            m.set_completion_callback(move |co| {
                completed.set(completed.get() + 1);
                if !chained.replace(true) {
                    let m = co.machine().unwrap();
                    Coroutine::new(&m, |_| Ok(())).unwrap();
                }
            });
        }
        Coroutine::new(&m, |_| Ok(())).unwrap();

        m.run().unwrap();
        assert_eq!(completed.get(), 2);
        assert_eq!(m.coroutine_count(), 0);
    }

    #[test]
    fn test_id_recycling_avoids_just_freed() {
        let m = machine();
        let c0 = Coroutine::new(&m, |_| Ok(())).unwrap();
        let c1 = Coroutine::new(&m, |_| Ok(())).unwrap();
        assert_eq!(c0.id().as_u32(), 0);
        assert_eq!(c1.id().as_u32(), 1);
        m.run().unwrap();

        // Ids 0 and 1 are free; 1 was freed last, so 0 is reused first,
        // then 1 is skipped once in favour of 2.
        let c2 = Coroutine::new(&m, |_| Ok(())).unwrap();
        assert_eq!(c2.id().as_u32(), 0);
        let c3 = Coroutine::new(&m, |_| Ok(())).unwrap();
        assert_eq!(c3.id().as_u32(), 2);
    }

    #[test]
    fn test_only_one_coroutine_running() {
        let m = machine();
        let handles: Rc<RefCell<Vec<Rc<Coroutine>>>> = Rc::new(RefCell::new(Vec::new()));
        let violations = Rc::new(Cell::new(0u32));
        for _ in 0..3 {
            let handles_inner = handles.clone();
            let violations = violations.clone();
            let co = Coroutine::new(&m, move |co| {
                for _ in 0..10 {
                    let running = handles_inner
                        .borrow()
                        .iter()
                        .filter(|c| c.state() == CoroState::Running)
                        .count();
                    if running != 1 || co.state() != CoroState::Running {
                        violations.set(violations.get() + 1);
                    }
                    co.yield_now()?;
                }
                Ok(())
            })
            .unwrap();
            handles.borrow_mut().push(co);
        }
        m.run().unwrap();
        assert_eq!(violations.get(), 0);
    }

    #[test]
    fn test_caller_slot_invariant() {
        let m = machine();
        let callee = Coroutine::builder()
            .autostart(false)
            .spawn(&m, |co| {
                co.yield_value(1u8)?;
                Ok(())
            })
            .unwrap();
        // Bound and unbound together around the call.
        assert!(!callee.has_caller());
        assert!(!callee.slot_is_bound());
        let clean_after_call = Rc::new(Cell::new(false));
        {
            let callee = callee.clone();
            let clean_after_call = clean_after_call.clone();
            Coroutine::new(&m, move |co| {
                co.call::<u8>(&callee)?;
                clean_after_call.set(!callee.has_caller() && !callee.slot_is_bound());
                Ok(())
            })
            .unwrap();
        }
        m.run().unwrap();
        assert!(clean_after_call.get());
    }

    #[test]
    fn test_panicking_body_kills_only_itself() {
        let m = machine();
        let completed = Rc::new(Cell::new(0u32));
        {
            let completed = completed.clone();
            m.set_completion_callback(move |_| completed.set(completed.get() + 1));
        }
        comux_core::cprint::set_log_level(comux_core::cprint::LogLevel::Off);
        Coroutine::new(&m, |_| panic!("boom")).unwrap();
        let survivor = Rc::new(Cell::new(false));
        {
            let survivor = survivor.clone();
            Coroutine::new(&m, move |co| {
                co.yield_now()?;
                survivor.set(true);
                Ok(())
            })
            .unwrap();
        }

        m.run().unwrap();
        assert!(survivor.get());
        assert_eq!(completed.get(), 2);
    }

    #[test]
    fn test_exit_terminates_coroutine() {
        let m = machine();
        let reached = Rc::new(Cell::new(false));
        {
            let reached = reached.clone();
            Coroutine::new(&m, move |co| {
                co.yield_now()?;
                if co.last_tick() > 0 {
                    co.exit();
                }
                reached.set(true);
                Ok(())
            })
            .unwrap();
        }
        m.run().unwrap();
        assert!(!reached.get());
        assert_eq!(m.coroutine_count(), 0);
    }

    #[test]
    fn test_embedded_poll_drives_to_completion() {
        let m = machine();
        let turns = Rc::new(Cell::new(0u32));
        {
            let turns = turns.clone();
            Coroutine::new(&m, move |co| {
                for _ in 0..3 {
                    turns.set(turns.get() + 1);
                    co.yield_now()?;
                }
                Ok(())
            })
            .unwrap();
        }

        let mut ps = PollState::new();
        let mut guard = 0;
        while m.coroutine_count() > 0 {
            m.get_poll_state(&mut ps);
            let timeout = if m.has_ready() { 0 } else { 100 };
            unsafe {
                libc::poll(
                    ps.pollfds.as_mut_ptr(),
                    ps.pollfds.len() as libc::nfds_t,
                    timeout,
                )
            };
            m.process_poll(&ps).unwrap();
            guard += 1;
            assert!(guard < 100, "embedded loop failed to make progress");
        }
        assert_eq!(turns.get(), 3);
    }

    #[test]
    fn test_pollset_owner_alignment() {
        let m = machine();
        let (r, w) = pipe2();
        let waiter = Coroutine::new(&m, move |co| {
            co.wait(r, libc::POLLIN, 0)?;
            Ok(())
        })
        .unwrap();

        // Drive one step so the waiter publishes its wait set.
        let mut ps = PollState::new();
        m.get_poll_state(&mut ps);
        unsafe { libc::poll(ps.pollfds.as_mut_ptr(), ps.pollfds.len() as libc::nfds_t, 0) };
        m.process_poll(&ps).unwrap();
        assert_eq!(waiter.state(), CoroState::Waiting);

        m.get_poll_state(&mut ps);
        assert_eq!(ps.pollfds.len(), ps.owners.len());
        // Entry 0 is the machine's interrupt fd.
        assert!(ps.owners[0].is_none());
        // The waiter contributes its event fd and the pipe fd.
        let owned: Vec<_> = ps
            .owners
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().map(|c| (i, c.id())))
            .collect();
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|(_, id)| *id == waiter.id()));
        assert_eq!(ps.pollfds[owned[1].0].fd, r);

        // Unblock and finish.
        let byte = [1u8];
        unsafe { libc::write(w, byte.as_ptr() as *const libc::c_void, 1) };
        m.run().unwrap();
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_id_exhaustion() {
        let m = CoroutineMachine::with_config(
            MachineConfig::from_env().max_coroutines(2),
        )
        .unwrap();
        let _a = Coroutine::new(&m, |_| Ok(())).unwrap();
        let _b = Coroutine::new(&m, |_| Ok(())).unwrap();
        assert!(matches!(
            Coroutine::new(&m, |_| Ok(())),
            Err(CoroError::IdExhausted)
        ));
    }
}
