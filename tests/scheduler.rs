use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use filament::sched::{self, Scheduler};
use filament::Fiber;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn closures_run_on_workers() {
    let sched = Scheduler::new(3, false, "pool");
    sched.start();
    let (tx, rx) = mpsc::channel();
    for i in 0..20 {
        let tx = tx.clone();
        sched.schedule_call(move || {
            tx.send(i).unwrap();
        });
    }
    let mut got: Vec<i32> = (0..20).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, (0..20).collect::<Vec<_>>());
    sched.stop();
}

#[test]
fn scheduled_fibers_can_yield_and_resume() {
    let sched = Scheduler::new(2, false, "yielders");
    sched.start();
    let (tx, rx) = mpsc::channel();
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    let fiber = Fiber::new(
        move || {
            c.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
            c.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
        },
        0,
        true,
    );
    sched.schedule(&fiber);
    rx.recv_timeout(WAIT).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    sched.stop();
}

#[test]
fn pinned_tasks_run_on_their_thread() {
    let sched = Scheduler::new(2, false, "pinned");
    sched.start();
    let ids = sched.thread_ids();
    assert_eq!(ids.len(), 2);
    let (tx, rx) = mpsc::channel();
    // more pinned tasks than workers: nobody starves, nobody misplaces
    for _round in 0..4 {
        for &tid in &ids {
            let tx = tx.clone();
            sched.schedule_call_pinned(
                move || {
                    tx.send((tid, sched::thread_id())).unwrap();
                },
                tid,
            );
        }
    }
    for _ in 0..8 {
        let (want, got) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(want, got);
    }
    sched.stop();
}

#[test]
fn use_caller_runs_the_final_pass_on_the_calling_thread() {
    let sched = Scheduler::new(1, true, "caller");
    sched.start();
    let me = sched::thread_id();
    let ran_on = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..5 {
        let ran_on = ran_on.clone();
        sched.schedule_call(move || {
            ran_on.lock().unwrap().push(sched::thread_id());
        });
    }
    // the caller is the only participant, so nothing has run yet
    assert!(ran_on.lock().unwrap().is_empty());
    sched.stop();
    let ran_on = ran_on.lock().unwrap();
    assert_eq!(ran_on.len(), 5);
    assert!(ran_on.iter().all(|&tid| tid == me));
}

#[test]
fn current_is_set_inside_workers() {
    let sched = Scheduler::new(1, false, "current");
    sched.start();
    let (tx, rx) = mpsc::channel();
    sched.schedule_call(move || {
        let current = Scheduler::current();
        tx.send(current.map(|s| s.name().to_owned())).unwrap();
    });
    assert_eq!(rx.recv_timeout(WAIT).unwrap().as_deref(), Some("current"));
    sched.stop();
}

#[test]
fn stop_drains_queued_work_before_returning() {
    let sched = Scheduler::new(2, false, "drain");
    sched.start();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let c = counter.clone();
        sched.schedule_call(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 50);
}
