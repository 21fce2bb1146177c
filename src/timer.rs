//! Deadline-ordered timers.
//!
//! Entries live in a set strictly ordered by `(deadline, sequence)` so that
//! removal by handle is unambiguous even when deadlines collide. All
//! mutations take the write lock; `refresh` and `reset` are implemented as
//! remove-then-insert to preserve the ordering invariant.
//!
//! Deadlines are milliseconds on the monotonic clock ([`crate::clock`]).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::clock;

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerInner {
    seq: u64,
    recurring: bool,
    period_ms: AtomicU64,
    deadline_ms: AtomicU64,
    /// Cleared on cancel and after a non-recurring fire; a cleared callback
    /// is never invoked.
    cb: Mutex<Option<TimerCallback>>,
    set: Weak<SetInner>,
}

impl TimerInner {
    #[inline]
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::Relaxed), self.seq)
    }
}

/// Handle to a pending timer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Cancel the timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let set = match self.inner.set.upgrade() {
            Some(set) => set,
            None => return false,
        };
        let mut timers = set.timers.write().unwrap();
        let had_cb = self.inner.cb.lock().unwrap().take().is_some();
        if !had_cb {
            return false;
        }
        timers.remove(&self.inner.key());
        true
    }

    /// Push the deadline out to `now + period`, keeping the period.
    pub fn refresh(&self) -> bool {
        let set = match self.inner.set.upgrade() {
            Some(set) => set,
            None => return false,
        };
        let mut timers = set.timers.write().unwrap();
        if self.inner.cb.lock().unwrap().is_none() {
            return false;
        }
        let entry = match timers.remove(&self.inner.key()) {
            Some(entry) => entry,
            None => return false,
        };
        let deadline = clock::now_ms() + self.inner.period_ms.load(Ordering::Relaxed);
        self.inner.deadline_ms.store(deadline, Ordering::Relaxed);
        timers.insert(self.inner.key(), entry);
        true
    }

    /// Change the period. With `from_now` the new deadline counts from now,
    /// otherwise from the entry's original epoch.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if self.inner.period_ms.load(Ordering::Relaxed) == period_ms && !from_now {
            return true;
        }
        let set = match self.inner.set.upgrade() {
            Some(set) => set,
            None => return false,
        };
        let entry;
        let at_front;
        {
            let mut timers = set.timers.write().unwrap();
            if self.inner.cb.lock().unwrap().is_none() {
                return false;
            }
            entry = match timers.remove(&self.inner.key()) {
                Some(entry) => entry,
                None => return false,
            };
            let start = if from_now {
                clock::now_ms()
            } else {
                self.inner.deadline_ms.load(Ordering::Relaxed)
                    - self.inner.period_ms.load(Ordering::Relaxed)
            };
            self.inner.period_ms.store(period_ms, Ordering::Relaxed);
            self.inner.deadline_ms.store(start + period_ms, Ordering::Relaxed);
            at_front = set.insert_locked(&mut timers, entry);
        }
        if at_front {
            set.wake();
        }
        true
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("seq", &self.inner.seq)
            .field("deadline_ms", &self.inner.deadline_ms.load(Ordering::Relaxed))
            .field("recurring", &self.inner.recurring)
            .finish_non_exhaustive()
    }
}

struct SetInner {
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerInner>>>,
    next_seq: AtomicU64,
    /// Set when the front change has been announced and not yet consumed by
    /// `next_timeout_ms`; suppresses redundant wakeups.
    tickled: AtomicBool,
    waker: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl SetInner {
    /// Insert under the held write lock. Returns whether the new entry became
    /// the front and the owner should be woken to shorten its wait.
    fn insert_locked(
        &self,
        timers: &mut BTreeMap<(u64, u64), Arc<TimerInner>>,
        entry: Arc<TimerInner>,
    ) -> bool {
        let key = entry.key();
        timers.insert(key, entry);
        let at_front = timers.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.get() {
            waker();
        }
    }
}

/// The set of pending timers owned by a reactor.
pub(crate) struct TimerSet {
    inner: Arc<SetInner>,
}

impl TimerSet {
    pub fn new() -> Self {
        TimerSet {
            inner: Arc::new(SetInner {
                timers: RwLock::new(BTreeMap::new()),
                next_seq: AtomicU64::new(1),
                tickled: AtomicBool::new(false),
                waker: OnceCell::new(),
            }),
        }
    }

    /// Install the front-change notification. Called once by the owner.
    pub fn set_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        let _ = self.inner.waker.set(waker);
    }

    /// Arm a timer `period_ms` from now.
    pub fn add_timer(&self, period_ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let entry = Arc::new(TimerInner {
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(period_ms),
            deadline_ms: AtomicU64::new(clock::now_ms() + period_ms),
            cb: Mutex::new(Some(cb)),
            set: Arc::downgrade(&self.inner),
        });
        let at_front = {
            let mut timers = self.inner.timers.write().unwrap();
            self.inner.insert_locked(&mut timers, entry.clone())
        };
        if at_front {
            self.inner.wake();
        }
        Timer { inner: entry }
    }

    /// Arm a timer that fires only while `cond` is still upgradable.
    ///
    /// This is the hook layer's idiom for telling "timed out" apart from
    /// "I/O completed first": the waiter drops the strong reference on the
    /// completion path, turning a late firing into a no-op.
    pub fn add_condition_timer<T>(
        &self,
        period_ms: u64,
        cb: TimerCallback,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        T: Send + Sync + 'static,
    {
        let gated: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(period_ms, gated, recurring)
    }

    /// Milliseconds until the earliest deadline: `Some(0)` if already
    /// expired, `None` if the set is empty.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        let timers = self.inner.timers.read().unwrap();
        self.inner.tickled.store(false, Ordering::Release);
        let (&(deadline, _), _) = timers.iter().next()?;
        Some(deadline.saturating_sub(clock::now_ms()))
    }

    /// Move every fired callback into `out`. Recurring entries are re-armed
    /// at `now + period`.
    pub fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = clock::now_ms();
        {
            let timers = self.inner.timers.read().unwrap();
            match timers.keys().next() {
                Some(&(deadline, _)) if deadline <= now => {}
                _ => return,
            }
        }

        let mut timers = self.inner.timers.write().unwrap();
        let pending: Vec<(u64, u64)> = timers
            .range(..=(now, u64::MAX))
            .map(|(&key, _)| key)
            .collect();
        for key in pending {
            let entry = match timers.remove(&key) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.recurring {
                let cb = entry.cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    out.push(cb);
                    let period = entry.period_ms.load(Ordering::Relaxed);
                    entry.deadline_ms.store(now + period, Ordering::Relaxed);
                    let key = entry.key();
                    timers.insert(key, entry);
                }
            } else if let Some(cb) = entry.cb.lock().unwrap().take() {
                out.push(cb);
            }
        }
    }

    pub fn has_timers(&self) -> bool {
        !self.inner.timers.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Duration;

    fn counter_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn next_timeout_tracks_the_front() {
        let set = TimerSet::new();
        assert_eq!(set.next_timeout_ms(), None);
        set.add_timer(500, Arc::new(|| {}), false);
        set.add_timer(50, Arc::new(|| {}), false);
        let next = set.next_timeout_ms().unwrap();
        assert!(next <= 50, "front should be the 50ms entry, got {}", next);
    }

    #[test]
    fn cancel_leaves_the_set_empty_and_never_fires() {
        let set = TimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = set.add_timer(1, counter_cb(&fired), false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!set.has_timers());
        sleep(Duration::from_millis(5));
        let mut out = Vec::new();
        set.drain_expired(&mut out);
        assert!(out.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drain_fires_expired_and_rearms_recurring() {
        let set = TimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));
        set.add_timer(1, counter_cb(&fired), true);
        set.add_timer(1, counter_cb(&fired), false);
        set.add_timer(60_000, counter_cb(&fired), false);
        sleep(Duration::from_millis(10));
        let mut out = Vec::new();
        set.drain_expired(&mut out);
        assert_eq!(out.len(), 2);
        for cb in &out {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        // the recurring entry is re-armed, the far one untouched
        assert!(set.has_timers());
        out.clear();
        sleep(Duration::from_millis(10));
        set.drain_expired(&mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn ties_are_broken_by_identity() {
        // two entries created back to back usually land on the same deadline;
        // the sequence tie-break keeps removal by handle unambiguous
        let set = TimerSet::new();
        let a = set.add_timer(10_000, Arc::new(|| {}), false);
        let b = set.add_timer(10_000, Arc::new(|| {}), false);
        assert!(a.cancel());
        assert!(set.has_timers());
        assert!(b.cancel());
        assert!(!set.has_timers());
    }

    #[test]
    fn refresh_pushes_the_deadline_out() {
        let set = TimerSet::new();
        let timer = set.add_timer(40, Arc::new(|| {}), false);
        sleep(Duration::from_millis(20));
        assert!(timer.refresh());
        let next = set.next_timeout_ms().unwrap();
        assert!(next > 25, "refresh should restart the period, got {}", next);
    }

    #[test]
    fn reset_from_now_and_from_epoch() {
        let set = TimerSet::new();
        let timer = set.add_timer(1_000, Arc::new(|| {}), false);
        assert!(timer.reset(100, true));
        let next = set.next_timeout_ms().unwrap();
        assert!(next <= 100);
        // same period, not from now: nothing to do
        assert!(timer.reset(100, false));
    }

    #[test]
    fn condition_timer_is_gated_on_the_guard() {
        let set = TimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let guard = Arc::new(());
        set.add_condition_timer(1, counter_cb(&fired), Arc::downgrade(&guard), false);
        let dead = Arc::new(());
        let dead_weak = Arc::downgrade(&dead);
        drop(dead);
        set.add_condition_timer(1, counter_cb(&fired), dead_weak, false);
        sleep(Duration::from_millis(10));
        let mut out = Vec::new();
        set.drain_expired(&mut out);
        assert_eq!(out.len(), 2);
        for cb in &out {
            cb();
        }
        // only the guarded-alive one actually ran
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
