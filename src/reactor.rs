//! Epoll reactor.
//!
//! The reactor extends the scheduler: it owns the epoll descriptor, the
//! timer set and a growable table of per-fd event slots, and runs the epoll
//! loop inside every worker's idle fiber. Each slot holds at most one waiter
//! (a fiber or a closure) per direction; on readiness the waiter is handed
//! back to its scheduler's queue and the kernel registration is narrowed to
//! the remaining interest.
//!
//! A self-pipe is registered edge-triggered; writing to it ("tickling") is
//! how new work wakes a thread blocked in `epoll_wait`.

use std::cell::RefCell;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, error, info, trace, warn};
use once_cell::sync::OnceCell;

use crate::error::Error;
use crate::fiber::Fiber;
use crate::sched::{Driver, Scheduler};
use crate::timer::{Timer, TimerSet};
use crate::Result;

bitflags::bitflags! {
    /// Logical I/O readiness directions, numerically aligned with the epoll
    /// bits they map to.
    pub struct Interest: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

#[derive(Default)]
struct EventCtx {
    /// The scheduler the waiter is handed back to when the event fires.
    sched: Option<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    call: Option<Box<dyn FnOnce() + Send>>,
}

impl EventCtx {
    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.call.is_none()
    }
}

struct SlotState {
    /// Directions currently registered in the kernel.
    interests: Interest,
    read: EventCtx,
    write: EventCtx,
}

impl SlotState {
    fn new() -> Self {
        SlotState {
            interests: Interest::empty(),
            read: EventCtx::default(),
            write: EventCtx::default(),
        }
    }

    fn ctx_mut(&mut self, interest: Interest) -> &mut EventCtx {
        if interest == Interest::READ {
            &mut self.read
        } else if interest == Interest::WRITE {
            &mut self.write
        } else {
            unreachable!("event context for a single direction only")
        }
    }
}

struct FdSlot {
    fd: RawFd,
    state: Mutex<SlotState>,
}

thread_local! {
    // Weak so that worker threads never keep their own reactor alive.
    static CURRENT_REACTOR: RefCell<Option<WeakReactor>> = RefCell::new(None);
}

/// Cheap-clone handle to a reactor. Derefs to its [`Scheduler`].
#[derive(Clone)]
pub struct Reactor {
    core: Arc<ReactorCore>,
}

struct ReactorCore {
    sched: Scheduler,
    timers: TimerSet,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    slots: RwLock<Vec<Arc<FdSlot>>>,
    /// Number of waiters currently registered across all slots.
    pending: AtomicUsize,
    self_ref: OnceCell<Weak<ReactorCore>>,
}

impl Reactor {
    /// Create a reactor and start its workers.
    ///
    /// `threads`, `use_caller` and `name` go to the embedded
    /// [`Scheduler::new`]. Call [`Scheduler::stop`] (via deref) to shut it
    /// down; dropping the last handle stops the workers without waiting for
    /// registered waiters.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Reactor> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut tickle_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(tickle_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0
        {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fds[0], &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(tickle_fds[0]);
                libc::close(tickle_fds[1]);
            }
            return Err(err.into());
        }

        let core = Arc::new(ReactorCore {
            sched: Scheduler::new(threads, use_caller, name),
            timers: TimerSet::new(),
            epfd,
            tickle_fds,
            slots: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            self_ref: OnceCell::new(),
        });
        let _ = core.self_ref.set(Arc::downgrade(&core));
        core.grow_slots(32);

        let driver: Arc<dyn Driver> = core.clone();
        core.sched.set_driver(Arc::downgrade(&driver));
        {
            let weak = Arc::downgrade(&core);
            core.timers.set_waker(Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.tickle_pipe();
                }
            }));
        }

        let reactor = Reactor { core };
        if use_caller {
            CURRENT_REACTOR.with(|c| *c.borrow_mut() = Some(reactor.downgrade()));
        }
        reactor.core.sched.start();
        debug!("reactor {} started, epfd {}", reactor.name(), epfd);
        Ok(reactor)
    }

    /// The reactor attached to the calling thread.
    pub fn current() -> Option<Reactor> {
        CURRENT_REACTOR.with(|c| c.borrow().as_ref().and_then(WeakReactor::upgrade))
    }

    /// Register interest in one direction on `fd`, with the currently
    /// running fiber as the waiter. The fiber is rescheduled exactly once:
    /// when the direction becomes ready, or when the registration is
    /// cancelled.
    pub fn add_event(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.core.add_event(fd, interest, None)
    }

    /// Like [`add_event`](Self::add_event), with a closure as the waiter.
    pub fn add_event_with<F>(&self, fd: RawFd, interest: Interest, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.add_event(fd, interest, Some(Box::new(cb)))
    }

    /// Drop a registration without waking its waiter.
    pub fn remove_event(&self, fd: RawFd, interest: Interest) -> bool {
        self.core.remove_event(fd, interest)
    }

    /// Drop a registration and hand its waiter back to the scheduler. This
    /// is the timeout path: the resumed fiber observes its cancellation
    /// token and turns the wakeup into an error.
    pub fn cancel_event(&self, fd: RawFd, interest: Interest) -> bool {
        self.core.cancel_event(fd, interest)
    }

    /// Cancel both directions on `fd`, waking any waiters.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.core.cancel_all(fd)
    }

    /// Arm a timer; the callback is scheduled on the reactor's workers.
    pub fn add_timer<F>(&self, period_ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.timers.add_timer(period_ms, Arc::new(cb), recurring)
    }

    /// Arm a timer gated on `cond` still being upgradable at fire time.
    pub fn add_condition_timer<F, T>(
        &self,
        period_ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.core
            .timers
            .add_condition_timer(period_ms, Arc::new(cb), cond, recurring)
    }

    /// Number of waiters currently registered across all fds.
    pub fn pending_event_count(&self) -> usize {
        self.core.pending.load(Ordering::SeqCst)
    }

    /// Whether any timer is still armed.
    pub fn has_pending_timers(&self) -> bool {
        self.core.timers.has_timers()
    }

    /// The embedded scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.core.sched
    }

    /// A non-owning handle, for callbacks that must not keep the reactor
    /// alive (e.g. timers stored inside the reactor itself).
    pub fn downgrade(&self) -> WeakReactor {
        WeakReactor {
            core: Arc::downgrade(&self.core),
        }
    }
}

/// Non-owning counterpart of [`Reactor`].
#[derive(Clone)]
pub struct WeakReactor {
    core: Weak<ReactorCore>,
}

impl WeakReactor {
    pub fn upgrade(&self) -> Option<Reactor> {
        self.core.upgrade().map(|core| Reactor { core })
    }
}

impl Deref for Reactor {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.core.sched
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name())
            .field("pending_events", &self.pending_event_count())
            .finish_non_exhaustive()
    }
}

impl ReactorCore {
    fn grow_slots(&self, len: usize) {
        let mut slots = self.slots.write().unwrap();
        while slots.len() < len {
            let next_fd = slots.len() as RawFd;
            slots.push(Arc::new(FdSlot {
                fd: next_fd,
                state: Mutex::new(SlotState::new()),
            }));
        }
    }

    /// Slot for `fd`, growing the table if needed.
    fn slot(&self, fd: RawFd) -> Arc<FdSlot> {
        assert!(fd >= 0, "invalid fd {}", fd);
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if let Some(slot) = slots.get(idx) {
                return slot.clone();
            }
        }
        self.grow_slots((idx + idx / 2 + 1).max(32));
        self.slots.read().unwrap()[idx].clone()
    }

    /// Slot for `fd` if the table already covers it.
    fn existing_slot(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        if fd < 0 {
            return None;
        }
        self.slots.read().unwrap().get(fd as usize).cloned()
    }

    fn add_event(
        &self,
        fd: RawFd,
        interest: Interest,
        call: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        assert!(
            interest == Interest::READ || interest == Interest::WRITE,
            "register one direction at a time"
        );
        let slot = self.slot(fd);
        let mut state = slot.state.lock().unwrap();
        if state.interests.intersects(interest) {
            error!(
                "add_event: fd {} already has a waiter for {:?} (registered: {:?})",
                fd, interest, state.interests
            );
            return Err(Error::EventRegistration { fd, interest });
        }

        let op = if state.interests.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | (state.interests | interest).bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            error!(
                "add_event: epoll_ctl(op {}, fd {}, {:?}) failed: {}",
                op,
                fd,
                interest,
                io::Error::last_os_error()
            );
            return Err(Error::EventRegistration { fd, interest });
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        state.interests |= interest;
        let target = Scheduler::current().unwrap_or_else(|| self.sched.clone());
        let ctx = state.ctx_mut(interest);
        assert!(ctx.is_empty() && ctx.sched.is_none());
        ctx.sched = Some(target);
        match call {
            Some(call) => ctx.call = Some(call),
            None => ctx.fiber = Some(Fiber::current()),
        }
        trace!("add_event: fd {} {:?} registered", fd, interest);
        Ok(())
    }

    fn update_kernel(&self, fd: RawFd, remaining: Interest) -> bool {
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | remaining.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            error!(
                "epoll_ctl(op {}, fd {}) failed: {}",
                op,
                fd,
                io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    fn remove_event(&self, fd: RawFd, interest: Interest) -> bool {
        let slot = match self.existing_slot(fd) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = slot.state.lock().unwrap();
        if !state.interests.contains(interest) {
            debug!("remove_event: fd {} has no {:?} registration", fd, interest);
            return false;
        }
        let remaining = state.interests - interest;
        if !self.update_kernel(fd, remaining) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        state.interests = remaining;
        *state.ctx_mut(interest) = EventCtx::default();
        true
    }

    fn cancel_event(&self, fd: RawFd, interest: Interest) -> bool {
        let slot = match self.existing_slot(fd) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = slot.state.lock().unwrap();
        if !state.interests.contains(interest) {
            debug!("cancel_event: fd {} has no {:?} registration", fd, interest);
            return false;
        }
        let remaining = state.interests - interest;
        if !self.update_kernel(fd, remaining) {
            return false;
        }
        state.interests = remaining;
        self.fire(&mut state, interest, fd);
        true
    }

    fn cancel_all(&self, fd: RawFd) -> bool {
        let slot = match self.existing_slot(fd) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = slot.state.lock().unwrap();
        if state.interests.is_empty() {
            debug!("cancel_all: fd {} has no registrations", fd);
            return false;
        }
        if !self.update_kernel(fd, Interest::empty()) {
            return false;
        }
        let registered = state.interests;
        state.interests = Interest::empty();
        if registered.contains(Interest::READ) {
            self.fire(&mut state, Interest::READ, fd);
        }
        if registered.contains(Interest::WRITE) {
            self.fire(&mut state, Interest::WRITE, fd);
        }
        true
    }

    /// Hand the stored waiter back to its scheduler and clear the context.
    /// The caller has already dropped the direction from `interests`.
    fn fire(&self, state: &mut SlotState, interest: Interest, fd: RawFd) {
        let ctx = state.ctx_mut(interest);
        assert!(!ctx.is_empty(), "no waiter registered for fd {} {:?}", fd, interest);
        let sched = ctx.sched.take().expect("waiter without a scheduler");
        let fiber = ctx.fiber.take();
        let call = ctx.call.take();
        self.pending.fetch_sub(1, Ordering::SeqCst);
        trace!("fire: fd {} {:?}", fd, interest);
        match (fiber, call) {
            (Some(fiber), _) => sched.schedule(&fiber),
            (None, Some(call)) => sched.schedule_call(call),
            (None, None) => unreachable!(),
        }
    }

    fn tickle_pipe(&self) {
        if !self.sched.has_idle_workers() {
            return;
        }
        let n = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"t".as_ptr() as *const libc::c_void,
                1,
            )
        };
        if n != 1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("tickle write failed: {}", err);
            }
        }
    }

    /// Full shutdown predicate: no timers, no registered waiters, and the
    /// scheduler side is drained.
    fn stopping(&self) -> bool {
        self.timers.next_timeout_ms().is_none()
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.stopping_base()
    }
}

impl Driver for ReactorCore {
    fn on_thread_start(&self) {
        if let Some(weak) = self.self_ref.get() {
            let weak = WeakReactor { core: weak.clone() };
            CURRENT_REACTOR.with(|c| *c.borrow_mut() = Some(weak));
        }
    }

    fn tickle(&self) {
        self.tickle_pipe();
    }

    fn stopped(&self) -> bool {
        self.timers.next_timeout_ms().is_none() && self.pending.load(Ordering::SeqCst) == 0
    }

    fn idle_step(&self) -> bool {
        const MAX_EVENTS: usize = 256;
        const MAX_BLOCK_MS: u64 = 3_000;

        if self.stopping() {
            info!("reactor {} idle loop exiting", self.sched.name());
            return true;
        }

        let timeout = self
            .timers
            .next_timeout_ms()
            .map(|ms| ms.min(MAX_BLOCK_MS))
            .unwrap_or(MAX_BLOCK_MS);
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    timeout as i32,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!("epoll_wait failed: {}", err);
                break 0;
            }
            break rc as usize;
        };

        let mut expired = Vec::new();
        self.timers.drain_expired(&mut expired);
        for cb in expired {
            self.sched.schedule_call(move || cb());
        }

        for ev in &events[..n] {
            let fd = ev.u64 as RawFd;
            if fd == self.tickle_fds[0] {
                let mut buf = [0u8; 256];
                while unsafe {
                    libc::read(
                        self.tickle_fds[0],
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                } > 0
                {}
                continue;
            }

            let slot = match self.existing_slot(fd) {
                Some(slot) => slot,
                None => continue,
            };
            debug_assert_eq!(slot.fd, fd);
            let mut state = slot.state.lock().unwrap();
            let mut raw = ev.events;
            if raw & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                // a failed or hung-up fd must wake both directions
                raw |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
            }
            let fired = Interest::from_bits_truncate(raw) & state.interests;
            if fired.is_empty() {
                continue;
            }
            let remaining = state.interests - fired;
            if !self.update_kernel(fd, remaining) {
                continue;
            }
            state.interests = remaining;
            if fired.contains(Interest::READ) {
                self.fire(&mut state, Interest::READ, fd);
            }
            if fired.contains(Interest::WRITE) {
                self.fire(&mut state, Interest::WRITE, fd);
            }
        }
        false
    }
}

impl Drop for ReactorCore {
    fn drop(&mut self) {
        self.sched.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
