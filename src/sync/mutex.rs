use crate::{Cx, Error, TaskQueue, YieldMode};
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering::*},
};

/// A mutual exclusion lock for tasks.
///
/// Unlike [`std::sync::Mutex`], this does not own the data it protects: it
/// admits one task at a time between [`lock`](Self::lock) and
/// [`unlock`](Self::unlock). Tasks that find the lock held are suspended in
/// arrival order, and each unlock hands the lock directly to the next
/// waiter.
///
/// Any task may unlock the mutex; it is up to the caller to pair each unlock
/// with the lock that it releases. [`Mutex::with_lock`] does so for a
/// closure.
pub struct Mutex {
    /// The holder, plus every task waiting (or about to wait).
    count: AtomicUsize,
    queue: TaskQueue,
}

impl Mutex {
    /// Returns a new, unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            queue: TaskQueue::new(),
        }
    }

    /// Acquires the lock, suspending the calling task until it is available.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the mutex has been used by another
    ///   runtime.
    pub fn lock(&self, cx: &Cx) -> Result<(), Error> {
        if self.count.fetch_add(1, AcqRel) == 0 {
            tracing::trace!(task.id = %cx.id(), "Mutex::lock: acquired");
            return Ok(());
        }

        tracing::trace!(task.id = %cx.id(), "Mutex::lock: waiting");
        if let Err(error) = cx.suspend_and_enqueue(&self.queue) {
            self.count.fetch_sub(1, AcqRel);
            return Err(error);
        }
        // the unlocking task handed us the lock
        Ok(())
    }

    /// Releases the lock, handing it to the next waiting task if there is
    /// one.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] if the mutex is not locked.
    pub fn unlock(&self, cx: &Cx) -> Result<(), Error> {
        let waiting = self
            .count
            .fetch_update(AcqRel, Acquire, |count| count.checked_sub(1))
            .map_err(|_| Error::PermissionDenied)?
            - 1;
        if waiting == 0 {
            tracing::trace!(task.id = %cx.id(), "Mutex::unlock: released");
            return Ok(());
        }

        // a waiter has counted itself but may not have enqueued yet
        loop {
            match cx.dequeue_and_resume(&self.queue, None) {
                Ok(next) => {
                    tracing::trace!(task.id = %cx.id(), %next, waiting, "Mutex::unlock: handed off");
                    return Ok(());
                }
                Err(Error::NoEntry) => {
                    let _ = cx.yield_with(YieldMode::Default);
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Runs `f` while holding the lock.
    ///
    /// # Errors
    ///
    /// As for [`Mutex::lock`] and [`Mutex::unlock`].
    pub fn with_lock<T>(&self, cx: &Cx, f: impl FnOnce() -> T) -> Result<T, Error> {
        self.lock(cx)?;
        let ret = f();
        self.unlock(cx)?;
        Ok(ret)
    }

    /// Returns `true` if the lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.count.load(Acquire) > 0
    }

    /// Checks that the mutex can be torn down.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] if tasks are still waiting for the lock.
    pub fn finalize(&self) -> Result<(), Error> {
        if !self.queue.is_empty() {
            return Err(Error::Busy);
        }
        Ok(())
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("count", &self.count.load(Relaxed))
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn uncontended() {
        let cx = crate::init(Config::new().max_tasks(2).yield_iters(10)).unwrap();
        let mutex = Mutex::new();
        assert!(matches!(mutex.unlock(&cx), Err(Error::PermissionDenied)));

        mutex.lock(&cx).unwrap();
        assert!(mutex.is_locked());
        mutex.unlock(&cx).unwrap();
        assert!(!mutex.is_locked());

        assert_eq!(mutex.with_lock(&cx, || 7).unwrap(), 7);
        mutex.finalize().unwrap();
    }
}
