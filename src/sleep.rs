//! The sleep/wakeup engine.
//!
//! A scheduling domain whose run queue is empty parks here until another task
//! hands it work. How it parks is chosen by its [`SyncPolicy`].
use crate::util::{fence, pause};
use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicBool, AtomicU8, Ordering::*},
    thread,
    time::{Duration, Instant},
};

mycelium_bitfield::enum_from_bits! {
    /// How an idle scheduling domain waits for work.
    ///
    /// The policy is selected per domain, either when the task is spawned
    /// ([`Builder::sync_policy`](crate::Builder::sync_policy)), or later by
    /// the domain itself ([`Cx::set_sync_policy`](crate::Cx::set_sync_policy)).
    /// The runtime-wide default comes from [`Config::sync_policy`].
    ///
    /// [`Config::sync_policy`]: crate::Config::sync_policy
    #[derive(Debug, PartialEq, Eq, Hash, Default)]
    pub enum SyncPolicy<u8> {
        /// Spin and yield for a bounded number of rounds, then block.
        #[default]
        Auto = 0b00,
        /// Never block: spin on the wakeup flag.
        BusyWait = 0b01,
        /// Spin for a calibrated number of iterations, then yield the OS
        /// thread, forever.
        Yield = 0b10,
        /// Block on a counting semaphore.
        Blocking = 0b11,
    }
}

/// The error returned when parsing a [`SyncPolicy`] from a string fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown synchronization policy (expected busywait, yield, blocking or auto)")]
pub struct ParsePolicyError(());

/// An OS counting semaphore.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

/// Wakes every thread waiting for the next occurrence of an event.
///
/// Each notification advances an epoch; a waiter reads the epoch before
/// checking its condition, so a notification that lands in between is not
/// lost.
#[derive(Debug, Default)]
pub(crate) struct Notify {
    epoch: Mutex<u64>,
    cond: Condvar,
}

/// A scheduling domain's wakeup state.
#[derive(Debug)]
pub(crate) struct Sleep {
    woken: AtomicBool,
    /// The policy of the sleep in progress (or the last one).
    ///
    /// Wakers read this to decide whether the semaphore needs a post.
    active: AtomicU8,
    sem: Semaphore,
}

/// Spins on `cond` until it returns `true` or `iters` pause instructions
/// have been issued.
#[inline]
fn spin_until(iters: usize, mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..iters {
        if cond() {
            return true;
        }
        pause();
    }
    cond()
}

/// Measures how many pause instructions take as long as one OS-level yield.
pub(crate) fn calibrate() -> usize {
    const YIELDS: u32 = 100;
    const PAUSES: u32 = 10_000;
    const MIN: usize = 10;
    const MAX: usize = 100_000;

    let start = Instant::now();
    for _ in 0..YIELDS {
        thread::yield_now();
    }
    let per_yield = start.elapsed() / YIELDS;

    let start = Instant::now();
    for _ in 0..PAUSES {
        pause();
    }
    let pauses = start.elapsed().max(Duration::from_nanos(1));

    let iters = (per_yield.as_nanos() * u128::from(PAUSES)) / pauses.as_nanos();
    let iters = (iters as usize).clamp(MIN, MAX);
    tracing::debug!(?per_yield, ?pauses, iters, "calibrated yield iterations");
    iters
}

// === impl SyncPolicy ===

impl SyncPolicy {
    /// Returns `true` if a sleeper under this policy may be blocked on its
    /// semaphore, and so must be posted to be woken.
    #[must_use]
    pub(crate) fn blocks(self) -> bool {
        matches!(self, Self::Blocking | Self::Auto)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::BusyWait => "busywait",
            Self::Yield => "yield",
            Self::Blocking => "blocking",
        }
    }
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SyncPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "default" => Ok(Self::Auto),
            "busywait" | "busy-wait" | "busy_wait" | "spin" => Ok(Self::BusyWait),
            "yield" => Ok(Self::Yield),
            "blocking" | "block" => Ok(Self::Blocking),
            _ => Err(ParsePolicyError(())),
        }
    }
}

// === impl Semaphore ===

impl Semaphore {
    pub(crate) fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    #[cfg(test)]
    fn permits(&self) -> usize {
        *self.count.lock()
    }
}

// === impl Notify ===

impl Notify {
    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    pub(crate) fn notify_all(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Waits until the epoch moves past `seen`, or `timeout` elapses.
    ///
    /// Returns `true` if it was notified.
    pub(crate) fn wait_for(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            if self.cond.wait_until(&mut epoch, deadline).timed_out() {
                return *epoch != seen;
            }
        }
        true
    }
}

// === impl Sleep ===

impl Sleep {
    pub(crate) fn new(policy: SyncPolicy) -> Self {
        Self {
            woken: AtomicBool::new(false),
            active: AtomicU8::new(policy as u8),
            sem: Semaphore::default(),
        }
    }

    pub(crate) fn reset(&self, policy: SyncPolicy) {
        self.woken.store(false, Release);
        self.active.store(policy as u8, Release);
    }

    #[inline]
    pub(crate) fn is_woken(&self) -> bool {
        self.woken.load(SeqCst)
    }

    fn active(&self) -> SyncPolicy {
        // only ever stored from a `SyncPolicy`
        SyncPolicy::try_from(self.active.load(SeqCst)).unwrap_or(SyncPolicy::Blocking)
    }

    /// Wakes the sleeper.
    ///
    /// Returns `false` if it had already been woken and has not slept since.
    pub(crate) fn wakeup(&self) -> bool {
        if self.woken.load(Acquire) {
            return false;
        }

        fence();
        if test_dbg!(self.woken.swap(true, SeqCst)) {
            return false;
        }

        if self.active().blocks() {
            self.sem.post();
        }
        true
    }

    /// Parks the calling OS thread until [`Sleep::wakeup`] is called, then
    /// consumes the wakeup.
    ///
    /// `yield_iters` is the calibrated number of pause instructions
    /// equivalent to one OS-level yield, and `auto_rounds` bounds how long
    /// [`SyncPolicy::Auto`] spins before it blocks.
    pub(crate) fn sleep(&self, policy: SyncPolicy, yield_iters: usize, auto_rounds: usize) {
        self.active.store(policy as u8, SeqCst);
        fence();

        match policy {
            SyncPolicy::BusyWait => {
                while !self.is_woken() {
                    pause();
                }
            }
            SyncPolicy::Yield => {
                while !spin_until(yield_iters, || self.is_woken()) {
                    thread::yield_now();
                }
            }
            SyncPolicy::Auto => {
                let woken = (0..auto_rounds).any(|_| {
                    thread::yield_now();
                    spin_until(yield_iters, || self.is_woken())
                });
                if !woken {
                    self.block();
                }
            }
            SyncPolicy::Blocking => self.block(),
        }

        fence();
        self.woken.store(false, SeqCst);
    }

    fn block(&self) {
        while !self.is_woken() {
            self.sem.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn policy_parse_and_display() {
        for policy in [
            SyncPolicy::Auto,
            SyncPolicy::BusyWait,
            SyncPolicy::Yield,
            SyncPolicy::Blocking,
        ] {
            assert_eq!(policy.to_string().parse::<SyncPolicy>(), Ok(policy));
        }
        assert_eq!("BUSY-WAIT".parse(), Ok(SyncPolicy::BusyWait));
        assert!("sometimes".parse::<SyncPolicy>().is_err());
        assert_eq!(SyncPolicy::default(), SyncPolicy::Auto);
    }

    #[test]
    fn wakeup_is_idempotent() {
        let sleep = Sleep::new(SyncPolicy::Blocking);
        assert!(sleep.wakeup());
        assert!(!sleep.wakeup());
        assert_eq!(sleep.sem.permits(), 1);

        // a wakeup delivered before the sleep is not lost
        sleep.sleep(SyncPolicy::Blocking, 10, 1);
        assert!(!sleep.is_woken());
        assert!(sleep.wakeup());
    }

    #[test]
    fn notify_wakes_waiters_and_is_not_lost() {
        let notify = Arc::new(Notify::default());
        let seen = notify.epoch();
        notify.notify_all();
        // already moved on: returns without waiting
        assert!(notify.wait_for(seen, Duration::from_secs(60)));
        assert!(!notify.wait_for(notify.epoch(), Duration::from_millis(1)));

        let seen = notify.epoch();
        let waiter = {
            let notify = notify.clone();
            thread::spawn(move || notify.wait_for(seen, Duration::from_secs(60)))
        };
        thread::sleep(Duration::from_millis(10));
        notify.notify_all();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn spinning_policies_do_not_post() {
        let sleep = Sleep::new(SyncPolicy::BusyWait);
        assert!(sleep.wakeup());
        assert_eq!(sleep.sem.permits(), 0);
        sleep.sleep(SyncPolicy::Yield, 10, 1);
        assert!(!sleep.is_woken());
    }

    fn wake_from_thread(policy: SyncPolicy) {
        let _trace = crate::test_util::trace_init();
        let sleep = Arc::new(Sleep::new(policy));
        let waker = {
            let sleep = sleep.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sleep.wakeup();
            })
        };
        sleep.sleep(policy, 100, 2);
        waker.join().unwrap();
        assert!(!sleep.is_woken());
    }

    #[test]
    fn wake_busywait() {
        wake_from_thread(SyncPolicy::BusyWait);
    }

    #[test]
    fn wake_yield() {
        wake_from_thread(SyncPolicy::Yield);
    }

    #[test]
    fn wake_blocking() {
        wake_from_thread(SyncPolicy::Blocking);
    }

    #[test]
    fn wake_auto() {
        wake_from_thread(SyncPolicy::Auto);
    }

    #[test]
    fn calibration_is_clamped() {
        let iters = calibrate();
        assert!((10..=100_000).contains(&iters), "iters = {iters}");
    }
}
