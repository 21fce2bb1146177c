//! M:N fiber scheduler.
//!
//! A pool of worker threads drains a single shared FIFO of tasks. A task is
//! either a fiber to resume or a bare closure, which the worker runs inside
//! a reusable per-worker callback fiber. Tasks may be pinned to one worker
//! by kernel tid; other workers skip pinned tasks.
//!
//! The reactor plugs into the dispatch loop through the crate-private
//! [`Driver`] trait: it provides the tickle mechanism, the idle routine run
//! when a worker finds no task, and extra shutdown conditions. A bare
//! scheduler without a driver idles by yielding until stopped.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread::JoinHandle;

use log::{debug, trace};
use once_cell::sync::OnceCell;

use crate::fiber::{Fiber, State};
use crate::hook;

/// Task affinity wildcard: any worker may run the task.
pub const ANY_THREAD: libc::pid_t = -1;

/// Kernel tid of the calling thread.
pub fn thread_id() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// The seam between the generic dispatch loop and its owner (the reactor).
pub(crate) trait Driver: Send + Sync {
    /// Called once when a worker thread enters the dispatch loop.
    fn on_thread_start(&self);
    /// Wake at least one worker blocked in its idle routine.
    fn tickle(&self);
    /// One cycle of the idle routine, run inside the idle fiber. Returns
    /// true when the owner is stopped and the idle fiber should exit.
    fn idle_step(&self) -> bool;
    /// Extra conditions the owner adds to the shutdown predicate.
    fn stopped(&self) -> bool;
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

struct Task {
    fiber: Option<Arc<Fiber>>,
    call: Option<Box<dyn FnOnce() + Send>>,
    thread: libc::pid_t,
    id: u64,
}

impl Task {
    fn from_fiber(fiber: Arc<Fiber>, thread: libc::pid_t) -> Task {
        Task {
            fiber: Some(fiber),
            call: None,
            thread,
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn from_call(call: Box<dyn FnOnce() + Send>, thread: libc::pid_t) -> Task {
        Task {
            fiber: None,
            call: Some(call),
            thread,
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Scheduler>> = RefCell::new(None);
    /// The fiber running the dispatch loop on this thread.
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// The fiber running the scheduler loop on this thread, if any. This is the
/// yield target of fibers created with `run_in_scheduler`.
pub(crate) fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|f| f.borrow().clone())
}

fn set_scheduler_fiber(fiber: Arc<Fiber>) {
    SCHED_FIBER.with(|f| *f.borrow_mut() = Some(fiber));
}

/// Cheap-clone handle to an M:N scheduler.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Core>,
}

struct Core {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<libc::pid_t>>,
    /// Worker threads to spawn (the caller, when participating, is not
    /// counted here).
    thread_count: usize,
    active: AtomicUsize,
    idle_workers: AtomicUsize,
    /// True until `start`, and again from `stop` on.
    stop_requested: AtomicBool,
    auto_stop: AtomicBool,
    root_tid: libc::pid_t,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    driver: OnceCell<Weak<dyn Driver>>,
}

impl Scheduler {
    /// Create a scheduler named `name` dispatching over `threads` threads.
    ///
    /// With `use_caller` the constructing thread itself participates: only
    /// `threads - 1` extra OS threads are spawned, and the final dispatch
    /// pass runs on the calling thread during [`stop`](Self::stop).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0, "threads must be at least 1");
        let mut worker_count = threads;
        let root_tid = if use_caller {
            Fiber::current();
            worker_count -= 1;
            thread_id()
        } else {
            ANY_THREAD
        };

        let sched = Scheduler {
            core: Arc::new(Core {
                name: name.to_owned(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(Vec::new()),
                thread_count: worker_count,
                active: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                root_tid,
                root_fiber: Mutex::new(None),
                driver: OnceCell::new(),
            }),
        };

        if use_caller {
            assert!(
                Scheduler::current().is_none(),
                "a scheduler is already attached to this thread"
            );
            let core = sched.core.clone();
            let root = Fiber::new(move || Core::run(core), 0, false);
            set_scheduler_fiber(root.clone());
            *sched.core.root_fiber.lock().unwrap() = Some(root);
            CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(sched.clone()));
        }
        sched
    }

    /// The scheduler attached to the calling thread.
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHED.with(|c| c.borrow().clone())
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Kernel tids of all participating threads, the caller included when it
    /// participates. Useful for pinning tasks.
    pub fn thread_ids(&self) -> Vec<libc::pid_t> {
        self.core.thread_ids.lock().unwrap().clone()
    }

    /// Enqueue a fiber for any worker.
    pub fn schedule(&self, fiber: &Arc<Fiber>) {
        self.core.push(Task::from_fiber(fiber.clone(), ANY_THREAD));
    }

    /// Enqueue a fiber pinned to the worker with kernel tid `thread`.
    pub fn schedule_pinned(&self, fiber: &Arc<Fiber>, thread: libc::pid_t) {
        self.core.push(Task::from_fiber(fiber.clone(), thread));
    }

    /// Enqueue a closure; the worker runs it inside a fiber, so it may use
    /// the hooked blocking calls.
    pub fn schedule_call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push(Task::from_call(Box::new(f), ANY_THREAD));
    }

    /// Enqueue a closure pinned to the worker with kernel tid `thread`.
    pub fn schedule_call_pinned<F>(&self, f: F, thread: libc::pid_t)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push(Task::from_call(Box::new(f), thread));
    }

    /// Spawn the worker threads. Idempotent; returns once every worker is
    /// running.
    pub fn start(&self) {
        if !self.core.stop_requested.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("scheduler {} starting {} workers", self.core.name, self.core.thread_count);
        let mut threads = self.core.threads.lock().unwrap();
        assert!(threads.is_empty(), "scheduler {} already has workers", self.core.name);
        let (tx, rx) = mpsc::channel();
        for i in 0..self.core.thread_count {
            let core = self.core.clone();
            let tx = tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_{}", self.core.name, i))
                .spawn(move || {
                    let _ = tx.send(thread_id());
                    Core::run(core);
                })
                .expect("failed to spawn a scheduler worker thread");
            threads.push(handle);
        }
        drop(tx);
        let mut ids = self.core.thread_ids.lock().unwrap();
        for tid in rx.iter().take(self.core.thread_count) {
            ids.push(tid);
        }
        if self.core.root_tid != ANY_THREAD {
            ids.push(self.core.root_tid);
        }
    }

    /// Request shutdown and wait for it: tickle every worker, run the final
    /// dispatch pass on the calling thread when it participates, then join.
    /// After `stop` returns no further tasks run.
    pub fn stop(&self) {
        debug!("scheduler {} stop", self.core.name);
        self.core.auto_stop.store(true, Ordering::SeqCst);
        self.core.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.core.thread_count {
            self.core.tickle();
        }

        let root = self.core.root_fiber.lock().unwrap().clone();
        if let Some(root) = root {
            self.core.tickle();
            if !self.core.stopping() && !matches!(root.state(), State::Term | State::Except) {
                root.resume();
            }
        }

        let handles: Vec<_> = self.core.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        assert_eq!(self.core.active.load(Ordering::SeqCst), 0);

        // Detach from the caller thread so it can host another scheduler.
        if thread_id() == self.core.root_tid {
            CURRENT_SCHED.with(|c| {
                let mine = matches!(&*c.borrow(), Some(s) if Arc::ptr_eq(&s.core, &self.core));
                if mine {
                    *c.borrow_mut() = None;
                }
            });
            SCHED_FIBER.with(|f| *f.borrow_mut() = None);
        }
    }

    pub(crate) fn set_driver(&self, driver: Weak<dyn Driver>) {
        let _ = self.core.driver.set(driver);
    }

    pub(crate) fn has_idle_workers(&self) -> bool {
        self.core.idle_workers.load(Ordering::SeqCst) > 0
    }

    /// The scheduler part of the shutdown predicate: stop requested, queue
    /// drained, no worker mid-task.
    pub(crate) fn stopping_base(&self) -> bool {
        self.core.base_stopping()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.core.name)
            .field("threads", &self.core.thread_count)
            .finish_non_exhaustive()
    }
}

impl Core {
    fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.driver.get().and_then(|weak| weak.upgrade())
    }

    fn tickle(&self) {
        match self.driver() {
            Some(driver) => driver.tickle(),
            None => trace!("scheduler {} tickle", self.name),
        }
    }

    fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stop_requested.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }

    fn stopping(&self) -> bool {
        let base = self.base_stopping();
        match self.driver() {
            Some(driver) => base && driver.stopped(),
            None => base,
        }
    }

    fn push(&self, task: Task) {
        trace!(
            "scheduler {} new task {}, pinned to {}",
            self.name,
            task.id,
            task.thread
        );
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// The dispatch loop. Runs on every worker thread, and inside the root
    /// fiber on the calling thread when it participates.
    fn run(core: Arc<Core>) {
        let me = thread_id();
        debug!("scheduler {} dispatch loop on tid {}", core.name, me);
        CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(Scheduler { core: core.clone() }));
        hook::set_hook_enabled(true);
        if let Some(driver) = core.driver() {
            driver.on_thread_start();
        }
        if me != core.root_tid {
            set_scheduler_fiber(Fiber::current());
        }

        let idle_core = core.clone();
        let idle_fiber = Fiber::new(move || Core::idle_main(idle_core), 0, true);
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task = None;
            let mut tickle_me = false;
            {
                let mut queue = core.queue.lock().unwrap();
                let mut i = 0;
                while i < queue.len() {
                    let candidate = &queue[i];
                    if candidate.thread != ANY_THREAD && candidate.thread != me {
                        // pinned elsewhere: that worker may be asleep
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    if let Some(fiber) = &candidate.fiber {
                        if fiber.state() == State::Exec {
                            // another worker still owns this context
                            i += 1;
                            continue;
                        }
                    }
                    task = queue.remove(i);
                    core.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                if task.is_some() {
                    tickle_me = tickle_me || i < queue.len();
                }
            }
            if tickle_me {
                core.tickle();
            }

            match task {
                Some(Task { fiber: Some(fiber), id, .. }) => {
                    if matches!(fiber.state(), State::Term | State::Except) {
                        core.active.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    trace!("task {}: resuming fiber {}", id, fiber.id());
                    fiber.resume();
                    core.active.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        State::Ready => core.push(Task::from_fiber(fiber, ANY_THREAD)),
                        State::Term | State::Except => {}
                        _ => fiber.set_state(State::Hold),
                    }
                }
                Some(Task { call: Some(call), id, .. }) => {
                    let fiber = match &cb_fiber {
                        Some(fiber) => {
                            fiber.reset(call);
                            fiber.clone()
                        }
                        None => {
                            let fiber = Fiber::new(call, 0, true);
                            cb_fiber = Some(fiber.clone());
                            fiber
                        }
                    };
                    trace!("task {}: resuming callback fiber {}", id, fiber.id());
                    fiber.resume();
                    core.active.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        State::Ready => {
                            core.push(Task::from_fiber(fiber, ANY_THREAD));
                            cb_fiber = None;
                        }
                        // terminated: keep the fiber for the next closure
                        State::Term | State::Except => {}
                        _ => {
                            // suspended in I/O; the waiter owns it now
                            fiber.set_state(State::Hold);
                            cb_fiber = None;
                        }
                    }
                }
                Some(_) => {
                    // an empty task slipped in; nothing to run
                    core.active.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        debug!("scheduler {} worker {} exiting", core.name, me);
                        break;
                    }
                    core.idle_workers.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    core.idle_workers.fetch_sub(1, Ordering::SeqCst);
                    if !matches!(idle_fiber.state(), State::Term | State::Except) {
                        idle_fiber.set_state(State::Hold);
                    }
                }
            }
        }
    }

    /// Body of the per-worker idle fiber.
    fn idle_main(core: Arc<Core>) {
        debug!("scheduler {} idle fiber running", core.name);
        loop {
            let stopped = match core.driver() {
                Some(driver) => driver.idle_step(),
                None => core.base_stopping(),
            };
            if stopped {
                break;
            }
            Fiber::yield_to_hold();
        }
        debug!("scheduler {} idle fiber exiting", core.name);
    }
}
