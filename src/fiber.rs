//! Stackful cooperative fibers.
//!
//! A fiber is a user-space thread with its own private stack and an explicit
//! resume/yield protocol. `resume` switches the caller into the fiber;
//! the fiber gives the CPU back by yielding, which returns control to its
//! *return target*: the scheduler's worker fiber on the current thread for
//! fibers created to run under a scheduler, or the thread's main fiber
//! otherwise. The two targets exist because a task resumed by a dispatch
//! loop must yield back into that loop, not into whatever happened to be
//! running on the thread beforehand.
//!
//! Machine context save/restore goes through the libc `ucontext` family
//! (`getcontext`/`makecontext`/`swapcontext`). Stacks are `mmap`-ed with a
//! `PROT_NONE` guard page at the low end.

use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use log::{error, trace};
use once_cell::sync::OnceCell;

use crate::config;
use crate::sched;

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created (or reset), never resumed since.
    Init = 0,
    /// Runnable, waiting for a dispatcher to resume it.
    Ready = 1,
    /// Currently executing on some OS thread.
    Exec = 2,
    /// Suspended waiting for an external event.
    Hold = 3,
    /// The entry closure returned.
    Term = 4,
    /// The entry closure panicked.
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Exec,
            3 => State::Hold,
            4 => State::Term,
            5 => State::Except,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The fiber owning the CPU on this thread right now.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    /// Sentinel fiber representing the OS thread's original stack.
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

#[inline]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An mmap-ed fiber stack with a guard page at the low end.
struct Stack {
    base: *mut libc::c_void,
    len: usize,
}

impl Stack {
    fn new(size: usize) -> Stack {
        let page = page_size();
        let size = (size.max(page) + page - 1) & !(page - 1);
        let len = size + page;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        assert!(
            base != libc::MAP_FAILED,
            "mmap for a fiber stack of {} bytes failed",
            len
        );
        // Stacks grow down: the guard page sits at the start of the mapping.
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        assert_eq!(rc, 0, "mprotect on the fiber guard page failed");
        Stack { base, len }
    }

    #[inline]
    fn bottom(&self) -> *mut libc::c_void {
        unsafe { self.base.add(page_size()) }
    }

    #[inline]
    fn usable(&self) -> usize {
        self.len - page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base, self.len) };
    }
}

// The mapping is private to the owning fiber.
unsafe impl Send for Stack {}

struct Inner {
    ctx: Box<libc::ucontext_t>,
    /// `None` for a thread main fiber, which runs on the OS thread's stack.
    stack: Option<Stack>,
    entry: Option<Box<dyn FnOnce() + Send>>,
}

/// A stackful cooperative fiber.
///
/// Fibers are shared handles (`Arc`): the scheduler holds references in its
/// task queue and the reactor holds references in per-event waiters.
pub struct Fiber {
    id: u64,
    run_in_scheduler: bool,
    state: AtomicU8,
    /// Back-reference to the owning `Arc`, so `resume` can install the
    /// shared handle into the thread-local current slot.
    self_ref: OnceCell<Weak<Fiber>>,
    inner: UnsafeCell<Inner>,
}

// Safety: `inner` is only touched by the thread currently executing (or
// resuming) the fiber, and at most one OS thread executes a given fiber at
// any instant -- `resume` asserts it. Cross-thread handoffs of that right
// are ordered by the scheduler queue mutex and the reactor slot locks.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `entry` on its own stack when first
    /// resumed.
    ///
    /// `stack_size == 0` picks the configured `fiber.stack_size` default.
    /// `run_in_scheduler` selects the yield target: the scheduler's worker
    /// fiber of the resuming thread, or the thread's main fiber.
    pub fn new<F>(entry: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            config::get().fiber_stack_size
        } else {
            stack_size
        };
        let stack = Stack::new(stack_size);
        let mut ctx: Box<libc::ucontext_t> = unsafe { Box::new(mem::zeroed()) };
        unsafe {
            let rc = libc::getcontext(&mut *ctx);
            assert_eq!(rc, 0, "getcontext failed");
            ctx.uc_link = ptr::null_mut();
            ctx.uc_stack.ss_sp = stack.bottom();
            ctx.uc_stack.ss_size = stack.usable();
            libc::makecontext(&mut *ctx, fiber_entry, 0);
        }

        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        trace!(
            "fiber {} created, stack {} bytes, run_in_scheduler: {}",
            id,
            stack.usable(),
            run_in_scheduler
        );
        let fiber = Arc::new(Fiber {
            id,
            run_in_scheduler,
            state: AtomicU8::new(State::Init as u8),
            self_ref: OnceCell::new(),
            inner: UnsafeCell::new(Inner {
                ctx,
                stack: Some(stack),
                entry: Some(Box::new(entry)),
            }),
        });
        let _ = fiber.self_ref.set(Arc::downgrade(&fiber));
        fiber
    }

    /// The sentinel fiber standing for the thread's original stack. Its
    /// context slot is pure storage for `swapcontext`.
    fn main_fiber() -> Arc<Fiber> {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id: 0,
            run_in_scheduler: false,
            state: AtomicU8::new(State::Exec as u8),
            self_ref: OnceCell::new(),
            inner: UnsafeCell::new(Inner {
                ctx: unsafe { Box::new(mem::zeroed()) },
                stack: None,
                entry: None,
            }),
        });
        let _ = fiber.self_ref.set(Arc::downgrade(&fiber));
        fiber
    }

    /// The fiber owning the CPU on this thread. Lazily creates the thread's
    /// main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        let existing = CURRENT.with(|c| c.borrow().clone());
        if let Some(f) = existing {
            return f;
        }
        let main = Fiber::main_fiber();
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_MAIN.with(|m| *m.borrow_mut() = Some(main.clone()));
        trace!("main fiber created for the current thread");
        main
    }

    /// Id of the fiber owning the CPU, `0` when the thread has none yet
    /// (the main fiber's id is also `0`).
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
    }

    /// Number of live fibers in the process, thread main fibers included.
    pub fn total() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    fn ctx_ptr(&self) -> *mut libc::ucontext_t {
        unsafe { ptr::addr_of_mut!(*(*self.inner.get()).ctx) }
    }

    /// The owning shared handle.
    fn handle(&self) -> Arc<Fiber> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("fiber is not Arc-managed")
    }

    fn return_target(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            sched::scheduler_fiber().expect("no scheduler fiber on this thread")
        } else {
            THREAD_MAIN.with(|m| m.borrow().clone()).unwrap_or_else(Fiber::current)
        }
    }

    /// Switch from the caller's context into this fiber. The caller blocks
    /// until the fiber yields or terminates.
    pub fn resume(&self) {
        let st = self.state();
        assert!(
            matches!(st, State::Init | State::Ready | State::Hold),
            "cannot resume fiber {} in state {:?}",
            self.id,
            st
        );
        let target = self.return_target();
        assert!(
            !ptr::eq(self, &*target),
            "fiber {} cannot resume itself",
            self.id
        );
        CURRENT.with(|c| *c.borrow_mut() = Some(self.handle()));
        self.set_state(State::Exec);
        unsafe { switch(target.ctx_ptr(), self.ctx_ptr()) };
    }

    /// Reuse the stack for a new entry closure.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let st = self.state();
        assert!(
            matches!(st, State::Init | State::Term | State::Except),
            "cannot reset fiber {} in state {:?}",
            self.id,
            st
        );
        let inner = unsafe { &mut *self.inner.get() };
        let stack = inner.stack.as_ref().expect("cannot reset a thread main fiber");
        unsafe {
            let rc = libc::getcontext(&mut *inner.ctx);
            assert_eq!(rc, 0, "getcontext failed");
            inner.ctx.uc_link = ptr::null_mut();
            inner.ctx.uc_stack.ss_sp = stack.bottom();
            inner.ctx.uc_stack.ss_size = stack.usable();
            libc::makecontext(&mut *inner.ctx, fiber_entry, 0);
        }
        inner.entry = Some(Box::new(entry));
        self.set_state(State::Init);
    }

    /// Switch out of this (currently running) fiber back to its return
    /// target.
    pub(crate) fn switch_out(&self) {
        let target = self.return_target();
        assert!(
            !ptr::eq(self, &*target),
            "fiber {} has no context to yield to",
            self.id
        );
        CURRENT.with(|c| *c.borrow_mut() = Some(target.clone()));
        unsafe { switch(self.ctx_ptr(), target.ctx_ptr()) };
    }

    /// Yield the current fiber, leaving it runnable: the dispatcher puts it
    /// back on the queue.
    pub fn yield_to_ready() {
        let cur = Fiber::current();
        assert_eq!(cur.state(), State::Exec);
        cur.set_state(State::Ready);
        cur.switch_out();
    }

    /// Yield the current fiber until an external event reschedules it.
    ///
    /// The state stays `Exec` until the dispatcher demotes it to `Hold`
    /// after the switch completes; flipping it here would let another worker
    /// resume this context while it is still being saved.
    pub fn yield_to_hold() {
        let cur = Fiber::current();
        assert_eq!(cur.state(), State::Exec);
        cur.switch_out();
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        let inner = self.inner.get_mut();
        if inner.stack.is_some() {
            let st = self.state();
            assert!(
                matches!(st, State::Init | State::Term | State::Except),
                "fiber {} destroyed in state {:?}",
                self.id,
                st
            );
            trace!("fiber {} destroyed", self.id);
        } else {
            trace!("main fiber destroyed");
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("run_in_scheduler", &self.run_in_scheduler)
            .finish_non_exhaustive()
    }
}

unsafe fn switch(save: *mut libc::ucontext_t, load: *mut libc::ucontext_t) {
    let rc = libc::swapcontext(save, load);
    assert_eq!(rc, 0, "swapcontext failed");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "Box<dyn Any>"
    }
}

/// First frame of every fiber: runs the entry closure, records the outcome,
/// then hands control back. A panic never unwinds through `swapcontext`.
extern "C" fn fiber_entry() {
    let current = Fiber::current();
    let entry = unsafe { (*current.inner.get()).entry.take() }
        .expect("fiber resumed without an entry closure");
    match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => current.set_state(State::Term),
        Err(payload) => {
            current.set_state(State::Except);
            error!("fiber {} panicked: {}", current.id, panic_message(&*payload));
        }
    }
    // Give up our strong reference before the final switch; the thread-local
    // current slot keeps the fiber alive until control is handed back.
    let raw: *const Fiber = Arc::as_ptr(&current);
    drop(current);
    unsafe { (*raw).switch_out() };
    unreachable!("terminated fiber resumed");
}
