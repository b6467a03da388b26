use crate::{
    queue::List,
    util::fence,
    Cx, Error, TaskQueue, YieldMode,
};
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering::*},
};

/// A reusable rendezvous point for a fixed number of tasks.
///
/// Every task that calls [`Barrier::wait`] is suspended until `n` tasks have
/// called it, then all of them continue. The barrier then starts counting
/// the next `n` arrivals.
///
/// # Examples
///
/// ```
/// use hyphae::{Barrier, Config};
/// use std::sync::Arc;
///
/// let cx = hyphae::init(Config::new().max_tasks(4)).unwrap();
/// let barrier = Arc::new(Barrier::new(3).unwrap());
///
/// let tasks = (0..2)
///     .map(|_| {
///         let barrier = barrier.clone();
///         cx.spawn(move |cx| {
///             barrier.wait(cx).unwrap();
///             0
///         })
///         .unwrap()
///     })
///     .collect::<Vec<_>>();
///
/// barrier.wait(&cx).unwrap();
/// for task in tasks {
///     assert_eq!(cx.wait(task).unwrap(), 0);
/// }
/// assert_eq!(barrier.count(), 3);
/// ```
pub struct Barrier {
    init: usize,
    count: AtomicUsize,
    queue: TaskQueue,
}

impl Barrier {
    /// Returns a barrier for `n` tasks.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `n` is zero.
    pub fn new(n: usize) -> Result<Self, Error> {
        if n < 1 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            init: n,
            count: AtomicUsize::new(n),
            queue: TaskQueue::new(),
        })
    }

    /// Waits until `n` tasks have arrived.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the barrier has been used by another
    ///   runtime.
    pub fn wait(&self, cx: &Cx) -> Result<(), Error> {
        if self.init == 1 {
            return Ok(());
        }

        let remaining = self.arrive(cx);
        tracing::trace!(task.id = %cx.id(), remaining, "Barrier::wait");
        if remaining > 0 {
            return cx.suspend_and_enqueue(&self.queue);
        }

        // we are the last arrival. the others have already decremented the
        // count, but may not have finished enqueuing yet.
        let rt = &*cx.rt;
        let waiters = self.init - 1;
        let mut taken = List::new();
        let mut got = self.queue.take(&rt.tasks, Some(waiters), &mut taken);
        while got < waiters {
            let _ = cx.yield_with(YieldMode::Default);
            got += self.queue.take(&rt.tasks, Some(waiters - got), &mut taken);
        }

        self.count.store(self.init, Release);
        fence();
        tracing::debug!(task.id = %cx.id(), released = waiters, "barrier released");
        rt.resume_taken(cx.id(), &mut taken, None, &self.queue)
    }

    /// Counts one arrival, returning how many are still needed.
    ///
    /// An arrival for the next round that lands while the last arrival of
    /// this one is still releasing the waiters waits for the count to reset.
    fn arrive(&self, cx: &Cx) -> usize {
        let mut count = self.count.load(Acquire);
        loop {
            if count == 0 {
                let _ = cx.yield_with(YieldMode::Default);
                count = self.count.load(Acquire);
                continue;
            }
            match self
                .count
                .compare_exchange_weak(count, count - 1, AcqRel, Acquire)
            {
                Ok(_) => return count - 1,
                Err(actual) => count = actual,
            }
        }
    }

    /// Returns the number of arrivals still needed to release the barrier.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Acquire)
    }

    /// Checks that the barrier can be torn down.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] if tasks are still waiting on the barrier.
    pub fn finalize(&self) -> Result<(), Error> {
        if !self.queue.is_empty() {
            return Err(Error::Busy);
        }
        Ok(())
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("init", &self.init)
            .field("count", &self.count())
            .field("queue", &self.queue)
            .finish()
    }
}
