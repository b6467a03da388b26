//! The scheduler core.
//!
//! Every task runs in a *scheduling domain*: the task currently responsible
//! for choosing which of its dependents runs next. A task starts out as its
//! own domain. Each domain has a local run queue, touched only by whichever
//! context is currently executing on the domain's behalf, and an
//! out-of-domain inbox that any task may push to. Before every scheduling
//! decision the domain splices its inbox onto its run queue.
//!
//! Control only ever changes hands at the cooperative points exposed by
//! [`Cx`]: suspending onto a queue, yielding, coupling, decoupling, and
//! exiting. If a domain has nothing left to run, it parks in its sleep
//! context until another task hands it work.
use crate::{
    config::Config,
    context::{ContextSwitch, Switch},
    queue::{List, TaskQueue},
    sleep::{self, Notify, SyncPolicy},
    task::{Arena, Task, TaskId, TaskInfo},
    Error,
};
use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    panic, process,
    sync::{
        atomic::{AtomicUsize, Ordering::*},
        Arc, Weak,
    },
    thread,
};

/// State shared by every task in a runtime.
pub(crate) struct Runtime {
    /// Unique among every runtime created by this process.
    id: usize,
    pub(crate) tasks: Arena,
    pub(crate) config: Config,
    /// The number of pause instructions equivalent to one OS-level yield.
    pub(crate) yield_iters: usize,
    pub(crate) switch: Switch,
    /// Notified whenever a task terminates.
    pub(crate) exits: Notify,
    pub(crate) this: Weak<Runtime>,
}

/// The source of runtime IDs. Zero marks an unbound [`TaskQueue`].
static NEXT_RUNTIME_ID: AtomicUsize = AtomicUsize::new(1);

/// A task's handle to the scheduler.
///
/// Every scheduling operation is a method on the calling task's `Cx`: the
/// root task's `Cx` is returned by [`hyphae::init`](crate::init), and every
/// spawned task's body is passed a reference to its own. A `Cx` always acts
/// on behalf of the task it belongs to, so it cannot be sent to another
/// thread.
pub struct Cx {
    pub(crate) rt: Arc<Runtime>,
    id: TaskId,
    _not_send: PhantomData<*const ()>,
}

/// The outcome of a yield.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum Yield {
    /// Another task ran before the yield returned.
    Interrupted,
    /// There was nothing else to run; the yield returned immediately.
    Idle,
}

/// What [`Cx::yield_with`] yields to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum YieldMode {
    /// Yield to the next runnable task in this domain.
    User,
    /// Yield the OS thread only.
    System,
    /// Yield the OS thread, then to the next runnable task in this domain.
    Default,
}

/// Which context is terminating a domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Terminator {
    Body,
    Sleeper,
}

// === impl Runtime ===

impl Runtime {
    pub(crate) fn new(config: Config) -> Result<Arc<Self>, Error> {
        if config.max_tasks < 2 {
            tracing::warn!(max_tasks = config.max_tasks, "a runtime needs room for at least two tasks");
            return Err(Error::InvalidArgument);
        }

        let yield_iters = config.yield_iters.unwrap_or_else(sleep::calibrate).max(1);
        Ok(Arc::new_cyclic(|this| Self {
            id: NEXT_RUNTIME_ID.fetch_add(1, Relaxed),
            tasks: Arena::new(config.max_tasks),
            config,
            yield_iters,
            switch: Switch::default(),
            exits: Notify::default(),
            this: this.clone(),
        }))
    }

    pub(crate) fn start(config: Config) -> Result<Cx, Error> {
        let rt = Self::new(config)?;
        let sync = rt.config.sync_policy;
        let root = rt.tasks.claim(Some("root".to_owned()), sync)?.id;
        debug_assert_eq!(root, TaskId::ROOT);
        tracing::info!(config = %rt.config, yield_iters = rt.yield_iters, "runtime started");
        Ok(Cx::new(rt, root))
    }

    /// Identifies this runtime to the queues bound to it.
    pub(crate) fn key(&self) -> usize {
        self.id
    }

    #[inline]
    pub(crate) fn task(&self, id: TaskId) -> &Task {
        self.tasks.get(id)
    }

    pub(crate) fn wakeup(&self, id: TaskId) {
        if self.task(id).sleep.wakeup() {
            tracing::trace!(task.id = %id, "woke domain");
        }
    }

    /// Splices `domain`'s inbox onto its run queue and pops the head.
    ///
    /// # Safety
    ///
    /// The caller must be the current executor of `domain`.
    unsafe fn next_runnable(&self, domain: TaskId) -> Option<TaskId> {
        let domain = self.task(domain);
        if domain.inbox.take_into(&self.tasks, &domain.run_queue) {
            domain.run_queue.pop_front(&self.tasks)
        } else {
            None
        }
    }

    pub(crate) fn suspend_and_enqueue(
        &self,
        me: TaskId,
        queue: &TaskQueue,
        after_enqueue: impl FnOnce(),
    ) -> Result<(), Error> {
        queue.bind(self.key())?;
        let task = self.task(me);
        if !task.state.try_suspend() {
            return Err(Error::PermissionDenied);
        }

        let sched = task.sched();
        let _span = tracing::debug_span!("suspend", task.id = %me, domain = %sched).entered();
        // Safety: `me` was running, so it is `sched`'s executor.
        let next = unsafe { self.next_runnable(sched) };
        let refcount = self.task(sched).refcount.fetch_add(1, SeqCst) + 1;
        tracing::debug!(?next, refcount, "suspending");

        // the stack must be protected before anyone can find us on the queue
        match next {
            Some(next) => {
                self.protect(me, &self.task(next).handoff);
                queue.push(&self.tasks, me);
                after_enqueue();
                self.swap(me, next);
            }
            None => {
                self.protect(me, &self.task(sched).sleeper.handoff);
                queue.push(&self.tasks, me);
                after_enqueue();
                self.decouple_switch(me, sched);
            }
        }
        tracing::debug!(domain = %task.sched(), "resumed");
        Ok(())
    }

    /// Checks that `domain` may accept a resumed task.
    fn check_domain(&self, domain: Option<TaskId>) -> Result<(), Error> {
        if let Some(domain) = domain {
            if self.tasks.lookup(domain)?.state.is_exit_requested() {
                return Err(Error::Busy);
            }
        }
        Ok(())
    }

    fn resume(&self, me: TaskId, target: TaskId, domain: Option<TaskId>) -> Result<(), Error> {
        if target == me {
            return Ok(());
        }

        let target_task = self.tasks.lookup(target)?;
        if target_task.state.is_running() {
            return Err(Error::PermissionDenied);
        }
        self.check_domain(domain)?;
        if !target_task.links.is_unlinked() {
            // still suspended on a queue: it must be dequeued first
            return Err(Error::Busy);
        }
        if !target_task.state.try_run() {
            return Err(Error::PermissionDenied);
        }

        let old = target_task.sched();
        let new = domain.unwrap_or(old);
        target_task.sched.store(Some(new), SeqCst);

        if self.task(me).sched() == new {
            tracing::trace!(task.id = %target, domain = %new, "resume locally");
            // Safety: `me` is running, so it is `new`'s executor.
            unsafe { self.task(new).run_queue.push_back(&self.tasks, target) };
        } else {
            tracing::trace!(task.id = %target, domain = %new, "resume out of domain");
            if self.task(new).inbox.push(&self.tasks, target) {
                self.wakeup(new);
            }
        }

        // drop the old domain's reference only once the task is visible in
        // the new one, so the old domain cannot miss it and terminate
        let old_task = self.task(old);
        let refcount = old_task.refcount.fetch_sub(1, SeqCst) - 1;
        if refcount < 0 {
            fatal!(&self.tasks, "refcount of {old} went negative resuming {target}");
        }
        if refcount == 0 && old != new && old_task.state.is_exit_requested() {
            // the old domain may be parked waiting to terminate
            self.wakeup(old);
        }
        Ok(())
    }

    fn dequeue_and_resume_n(
        &self,
        me: TaskId,
        queue: &TaskQueue,
        domain: Option<TaskId>,
        n: Option<usize>,
    ) -> Result<usize, Error> {
        queue.bind(self.key())?;
        self.check_domain(domain)?;

        let mut taken = List::new();
        let count = queue.take(&self.tasks, n, &mut taken);
        self.resume_taken(me, &mut taken, domain, queue)?;
        Ok(count)
    }

    /// Resumes every task on `taken`, a list of tasks just taken off `queue`.
    ///
    /// If a resume fails, the tasks not yet resumed go back on `queue`.
    pub(crate) fn resume_taken(
        &self,
        me: TaskId,
        taken: &mut List,
        domain: Option<TaskId>,
        queue: &TaskQueue,
    ) -> Result<(), Error> {
        while let Some(target) = taken.pop_front(&self.tasks) {
            if let Err(error) = self.resume(me, target, domain) {
                queue.push(&self.tasks, target);
                while let Some(rest) = taken.pop_front(&self.tasks) {
                    queue.push(&self.tasks, rest);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    fn user_yield(&self, me: TaskId) -> Yield {
        let sched = self.task(me).sched();
        let domain = self.task(sched);
        // Safety: `me` is running, so it is `sched`'s executor.
        let next = unsafe {
            if domain.inbox.len() > 0 {
                domain.inbox.take_into(&self.tasks, &domain.run_queue);
            }
            let Some(next) = domain.run_queue.pop_front(&self.tasks) else {
                return Yield::Idle;
            };
            self.protect(me, &self.task(next).handoff);
            domain.run_queue.push_back(&self.tasks, me);
            next
        };

        tracing::trace!(task.id = %me, next = %next, "yield");
        self.swap(me, next);
        Yield::Interrupted
    }

    fn yield_to(&self, me: TaskId, target: TaskId) -> Result<Yield, Error> {
        if target == me {
            return Ok(Yield::Idle);
        }

        let sched = self.task(me).sched();
        if self.tasks.lookup(target)?.sched() != sched {
            return Err(Error::PermissionDenied);
        }

        let domain = self.task(sched);
        // Safety: `me` is running, so it is `sched`'s executor.
        unsafe {
            if domain.inbox.len() > 0 {
                domain.inbox.take_into(&self.tasks, &domain.run_queue);
            }
            if !domain.run_queue.remove(&self.tasks, target) {
                return Err(Error::NoEntry);
            }
            self.protect(me, &self.task(target).handoff);
            domain.run_queue.push_back(&self.tasks, me);
        }

        tracing::trace!(task.id = %me, %target, "yield_to");
        self.swap(me, target);
        Ok(Yield::Interrupted)
    }

    fn couple(&self, me: TaskId) -> Result<(), Error> {
        let task = self.task(me);
        let sched = task.sched();
        if sched == me || task.coupled.load(Acquire).is_some() {
            return Err(Error::Busy);
        }

        let _span = tracing::debug_span!("couple", task.id = %me, domain = %sched).entered();
        task.coupled.store(Some(sched), Release);
        task.sched.store(Some(me), SeqCst);
        // this must happen before we appear in our own inbox, or we could be
        // picked as our own successor
        // Safety: `me` is still running in `sched`, as its executor.
        let next = unsafe { self.next_runnable(sched) };
        let into = match next {
            Some(next) => &self.task(next).handoff,
            None => &self.task(sched).sleeper.handoff,
        };
        self.protect(me, into);
        // our own domain picks us up once the switch has completed
        self.set_deferred(into, me);
        task.inbox.push(&self.tasks, me);

        match next {
            Some(next) => self.swap(me, next),
            None => self.decouple_switch(me, sched),
        }
        tracing::debug!("coupled");
        Ok(())
    }

    fn decouple(&self, me: TaskId, domain: Option<TaskId>) -> Result<(), Error> {
        let task = self.task(me);
        if task.sched() != me {
            return Err(Error::Busy);
        }
        let Some(target) = domain.or_else(|| task.coupled.load(Acquire)) else {
            return Err(Error::Busy);
        };
        let target_task = self.tasks.lookup(target)?;

        let _span = tracing::debug_span!("decouple", task.id = %me, domain = %target).entered();
        task.coupled.store(None, Release);
        task.sched.store(Some(target), SeqCst);

        let into = &task.sleeper.handoff;
        self.protect(me, into);
        if target_task.inbox.push(&self.tasks, me) {
            self.set_deferred(into, target);
        }
        self.decouple_switch(me, me);
        tracing::debug!("decoupled");
        Ok(())
    }

    /// Runs the exit protocol on the body of `me`.
    ///
    /// Returns once the task has terminated.
    pub(crate) fn do_exit(&self, me: TaskId) {
        let task = self.task(me);
        task.state.request_exit();
        let _span = tracing::debug_span!("exit", task.id = %me).entered();
        tracing::debug!(status = ?task.status(), "exit requested");

        loop {
            if task.state.is_exited() {
                return;
            }

            let sched = task.sched();
            // Safety: `me` is running, so it is `sched`'s executor.
            match unsafe { self.next_runnable(sched) } {
                Some(next) => {
                    let into = &self.task(next).handoff;
                    self.protect(me, into);
                    if me != sched {
                        // the switch leaves us unreachable in `sched`; our own
                        // domain finishes terminating us
                        self.set_deferred(into, me);
                    } else {
                        // keep scheduling until the domain drains
                        // Safety: as above.
                        unsafe { self.task(sched).run_queue.push_back(&self.tasks, me) };
                    }
                    self.swap(me, next);
                }
                None if me != sched => {
                    let into = &self.task(sched).sleeper.handoff;
                    self.protect(me, into);
                    self.set_deferred(into, me);
                    self.decouple_switch(me, sched);
                }
                None if task.able_to_terminate() => {
                    self.terminate(me, Terminator::Body);
                    return;
                }
                None => {
                    // dependents are still suspended; wait for them in the
                    // sleep context
                    tracing::debug!(refcount = task.refcount.load(Acquire), "waiting for dependents");
                    self.protect(me, &task.sleeper.handoff);
                    self.decouple_switch(me, me);
                }
            }
        }
    }

    fn terminate(&self, id: TaskId, by: Terminator) {
        let task = self.task(id);
        if !task.state.set_exited() {
            return;
        }
        tracing::debug!(task.id = %id, ?by, status = ?task.status(), "task terminated");
        self.exits.notify_all();

        // whichever of the two contexts did not terminate the task is parked,
        // and returns once resumed
        match by {
            Terminator::Body if task.sleeper.is_started() => self.switch.resume(&task.sleeper.ctx),
            Terminator::Body => {}
            Terminator::Sleeper => self.switch.resume(&task.ctx),
        }
    }

    /// The body of a domain's sleep context.
    pub(crate) fn sleep_loop(self: Arc<Self>, domain: TaskId) {
        let task = self.task(domain);
        let sleeper = &task.sleeper;
        let _span = tracing::debug_span!("sleep_loop", task.id = %domain).entered();
        self.switch.suspend(&sleeper.ctx);

        loop {
            if task.state.is_exited() {
                tracing::trace!("sleep context returning");
                return;
            }

            task.current.store(None, Release);
            self.unprotect(&sleeper.handoff);
            self.deliver_deferred(&sleeper.handoff);

            let next = loop {
                // Safety: while it runs, the sleep context is the domain's
                // executor.
                if let Some(next) = unsafe { self.next_runnable(domain) } {
                    break next;
                }
                if task.able_to_terminate() {
                    self.stack_wait(domain);
                    self.terminate(domain, Terminator::Sleeper);
                    return;
                }
                let policy = task.state.sync();
                tracing::trace!(%policy, "sleeping");
                task.sleep.sleep(policy, self.yield_iters, self.config.auto_rounds);
                tracing::trace!("woke");
            };

            tracing::trace!(next = %next, "running");
            task.current.store(Some(next), Release);
            self.couple_switch(domain, next);
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("yield_iters", &self.yield_iters)
            .field("tasks", &self.tasks)
            .finish()
    }
}

// === impl Cx ===

impl Cx {
    pub(crate) fn new(rt: Arc<Runtime>, id: TaskId) -> Self {
        Self {
            rt,
            id,
            _not_send: PhantomData,
        }
    }

    fn task(&self) -> &Task {
        self.rt.task(self.id)
    }

    /// Returns the calling task's ID.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the calling task's current scheduling domain.
    #[must_use]
    pub fn domain(&self) -> TaskId {
        self.task().sched()
    }

    /// Returns the number of tasks waiting on the current domain's run queue.
    ///
    /// Tasks in the domain's out-of-domain queue are not counted until the
    /// domain next makes a scheduling decision.
    #[must_use]
    pub fn count_runnable(&self) -> usize {
        self.rt.task(self.domain()).run_queue.len()
    }

    /// Returns a snapshot of a task's scheduling state.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `id` does not name a live task.
    pub fn info(&self, id: TaskId) -> Result<TaskInfo, Error> {
        Ok(self.rt.tasks.lookup(id)?.info())
    }

    /// Returns the number of live tasks other than the root task.
    ///
    /// Tasks that have terminated but have not yet been waited for are
    /// counted.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.rt.tasks.live().filter(|task| task.id != TaskId::ROOT).count()
    }

    /// Returns the most tasks that can be live at once, not counting the root
    /// task.
    #[must_use]
    pub fn max_tasks(&self) -> usize {
        self.rt.tasks.capacity() - 1
    }

    /// Attaches a value to a task (the caller, if `id` is `None`), replacing
    /// any value attached before.
    ///
    /// The runtime never looks at the value; it is dropped when the task is
    /// waited for.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `id` does not name a live task.
    pub fn set_aux<T>(&self, id: Option<TaskId>, value: T) -> Result<(), Error>
    where
        T: Any + Send + Sync,
    {
        let task = self.rt.tasks.lookup(id.unwrap_or(self.id))?;
        task.replace_aux(Some(Arc::new(value)));
        Ok(())
    }

    /// Returns the value attached to a task (the caller, if `id` is `None`)
    /// with [`Cx::set_aux`], if there is one and it is a `T`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `id` does not name a live task.
    pub fn aux<T>(&self, id: Option<TaskId>) -> Result<Option<Arc<T>>, Error>
    where
        T: Any + Send + Sync,
    {
        let task = self.rt.tasks.lookup(id.unwrap_or(self.id))?;
        Ok(task.aux().and_then(|aux| aux.downcast::<T>().ok()))
    }

    /// Returns the calling task's synchronization policy.
    #[must_use]
    pub fn sync_policy(&self) -> SyncPolicy {
        self.task().state.sync()
    }

    /// Sets the synchronization policy the calling task uses when it sleeps
    /// as a scheduling domain.
    ///
    /// The new policy takes effect the next time the domain sleeps.
    pub fn set_sync_policy(&self, policy: SyncPolicy) {
        tracing::debug!(task.id = %self.id, %policy, "set sync policy");
        self.task().state.set_sync(policy);
    }

    /// Suspends the calling task onto `queue`, and runs the next runnable task
    /// in its domain (or parks the domain, if there is none).
    ///
    /// Returns once another task resumes the caller with
    /// [`Cx::dequeue_and_resume`] or its relatives.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] if the caller is already suspended.
    /// - [`Error::InvalidArgument`] if `queue` belongs to another runtime.
    pub fn suspend_and_enqueue(&self, queue: &TaskQueue) -> Result<(), Error> {
        self.rt.suspend_and_enqueue(self.id, queue, || {})
    }

    /// Makes a suspended task runnable again.
    ///
    /// `target` is scheduled by `domain`, or by the domain it was suspended
    /// from if `domain` is `None`. A task resumed into the caller's own domain
    /// goes straight onto its run queue; otherwise it is handed to the
    /// domain's out-of-domain queue, waking the domain if needed.
    ///
    /// Resuming the calling task is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] if `target` is running or runnable.
    /// - [`Error::Busy`] if `domain` has asked to exit, or `target` is still
    ///   on a [`TaskQueue`] (take it off with [`TaskQueue::dequeue`] first).
    /// - [`Error::InvalidArgument`] if `target` or `domain` does not name a
    ///   live task.
    pub fn resume(&self, target: TaskId, domain: Option<TaskId>) -> Result<(), Error> {
        self.rt.resume(self.id, target, domain)
    }

    /// Takes the first task off `queue` and resumes it, returning its ID.
    ///
    /// # Errors
    ///
    /// - [`Error::NoEntry`] if the queue is empty.
    /// - [`Error::Busy`] if `domain` has asked to exit.
    /// - [`Error::InvalidArgument`] if `queue` belongs to another runtime, or
    ///   `domain` does not name a live task.
    pub fn dequeue_and_resume(&self, queue: &TaskQueue, domain: Option<TaskId>) -> Result<TaskId, Error> {
        queue.bind(self.rt.key())?;
        self.rt.check_domain(domain)?;
        let target = queue.pop(&self.rt.tasks).ok_or(Error::NoEntry)?;
        if let Err(error) = self.rt.resume(self.id, target, domain) {
            queue.push(&self.rt.tasks, target);
            return Err(error);
        }
        Ok(target)
    }

    /// Takes up to `n` tasks off `queue` (all of them, if `n` is `None`) and
    /// resumes each, returning how many were resumed.
    ///
    /// # Errors
    ///
    /// As for [`Cx::dequeue_and_resume`], except that an empty queue is not an
    /// error.
    pub fn dequeue_and_resume_n(
        &self,
        queue: &TaskQueue,
        domain: Option<TaskId>,
        n: Option<usize>,
    ) -> Result<usize, Error> {
        self.rt.dequeue_and_resume_n(self.id, queue, domain, n)
    }

    /// Moves up to `n` runnable tasks (all of them, if `n` is `None`) from the
    /// current domain's run queue onto `queue`, suspending them, and returns
    /// how many were moved.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `queue` belongs to another runtime.
    pub fn enqueue_runnable_n(&self, queue: &TaskQueue, n: Option<usize>) -> Result<usize, Error> {
        queue.bind(self.rt.key())?;
        let rt = &*self.rt;
        let sched = self.domain();
        let domain = rt.task(sched);
        let moved = queue.with_locked(|list| {
            // Safety: we are running, so we are `sched`'s executor.
            unsafe {
                domain.run_queue.drain(&rt.tasks, n, |id| {
                    rt.task(id).state.try_suspend();
                    domain.refcount.fetch_add(1, SeqCst);
                    if list.push_back(&rt.tasks, id).is_err() {
                        fatal!(&rt.tasks, "runnable task {id} was already queued");
                    }
                })
            }
        });
        tracing::debug!(task.id = %self.id, domain = %sched, moved, "enqueued runnable tasks");
        Ok(moved)
    }

    /// Yields to the next runnable task in the current domain.
    ///
    /// The caller goes to the back of the run queue. Returns
    /// [`Yield::Idle`] without switching if there is nothing else to run.
    pub fn yield_now(&self) -> Yield {
        self.rt.user_yield(self.id)
    }

    /// Yields the OS thread, the current domain, or both.
    pub fn yield_with(&self, mode: YieldMode) -> Yield {
        match mode {
            YieldMode::User => self.rt.user_yield(self.id),
            YieldMode::System => {
                thread::yield_now();
                Yield::Idle
            }
            YieldMode::Default => {
                thread::yield_now();
                self.rt.user_yield(self.id)
            }
        }
    }

    /// Yields directly to `target`, which must be runnable in the current
    /// domain.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] if `target` is scheduled by another
    ///   domain.
    /// - [`Error::NoEntry`] if `target` is not on the run queue (it is
    ///   suspended, or has not been picked up from the out-of-domain queue).
    /// - [`Error::InvalidArgument`] if `target` does not name a live task.
    pub fn yield_to(&self, target: TaskId) -> Result<Yield, Error> {
        self.rt.yield_to(self.id, target)
    }

    /// Leaves the current domain's scheduling and continues as a domain of
    /// its own, on the calling task's own sleep context.
    ///
    /// The task's previous domain goes on to run its next runnable task. Pair
    /// with [`Cx::decouple`] to rejoin it.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] if the caller is already its own domain, or is
    ///   already coupled.
    pub fn couple(&self) -> Result<(), Error> {
        self.rt.couple(self.id)
    }

    /// Rejoins a domain after [`Cx::couple`].
    ///
    /// The caller is handed to `domain` (or, if `None`, the domain it coupled
    /// from), and its own sleep context takes over its own domain.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] if the caller is not currently its own domain, or
    ///   `domain` is `None` and the caller is not coupled.
    /// - [`Error::InvalidArgument`] if `domain` does not name a live task.
    pub fn decouple(&self, domain: Option<TaskId>) -> Result<(), Error> {
        self.rt.decouple(self.id, domain)
    }

    /// Exits the calling task with `status`.
    ///
    /// The first recorded status wins: if the task's status has already been
    /// set, `status` is ignored. The task's body is unwound, and the task
    /// terminates once it no longer has dependents to schedule. Its status
    /// can then be collected with [`Cx::wait`].
    ///
    /// Exiting the root task exits the process once its dependents drain.
    pub fn exit(&self, status: i32) -> ! {
        let task = self.task();
        if !task.set_status(status) {
            tracing::debug!(task.id = %self.id, status, "exit status already recorded");
        }

        if self.id == TaskId::ROOT {
            self.rt.do_exit(self.id);
            process::exit(task.status().unwrap_or(status));
        }
        panic::resume_unwind(Box::new(crate::spawn::ExitUnwind))
    }
}

impl fmt::Debug for Cx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx").field("id", &self.id).finish_non_exhaustive()
    }
}

// === impl Yield ===

impl Yield {
    /// Returns `true` if another task ran before the yield returned.
    #[must_use]
    pub fn is_interrupted(self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_small() {
        let err = Runtime::new(Config::new().max_tasks(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument));
    }

    #[test]
    fn root_alone() {
        let _trace = crate::test_util::trace_init();
        let cx = crate::init(Config::new().max_tasks(2).yield_iters(10)).unwrap();
        assert_eq!(cx.id(), TaskId::ROOT);
        assert_eq!(cx.domain(), TaskId::ROOT);
        assert_eq!(cx.count_runnable(), 0);
        assert_eq!(cx.yield_now(), Yield::Idle);
        assert_eq!(cx.yield_with(YieldMode::System), Yield::Idle);
        assert_eq!(cx.yield_to(TaskId::ROOT).unwrap(), Yield::Idle);
        assert!(matches!(cx.couple(), Err(Error::Busy)));
        assert!(matches!(cx.decouple(None), Err(Error::Busy)));
        cx.resume(TaskId::ROOT, None).unwrap();

        let info = cx.info(TaskId::ROOT).unwrap();
        assert!(info.running);
        assert_eq!(info.name.as_deref(), Some("root"));
        assert_eq!(info.refcount, 0);
    }

    #[test]
    fn sync_policy_is_per_task() {
        let cx = crate::init(
            Config::new()
                .max_tasks(2)
                .yield_iters(10)
                .sync_policy(SyncPolicy::Yield),
        )
        .unwrap();
        assert_eq!(cx.sync_policy(), SyncPolicy::Yield);
        cx.set_sync_policy(SyncPolicy::Blocking);
        assert_eq!(cx.sync_policy(), SyncPolicy::Blocking);
        assert_eq!(cx.info(cx.id()).unwrap().sync_policy, SyncPolicy::Blocking);
    }

    #[test]
    fn queue_stays_bound_to_a_dropped_runtime() {
        let queue = TaskQueue::new();
        let first = {
            let cx = crate::init(Config::new().max_tasks(2).yield_iters(10)).unwrap();
            assert!(matches!(cx.dequeue_and_resume(&queue, None), Err(Error::NoEntry)));
            cx.rt.key()
        };
        // the next runtime may well be allocated where the last one was
        let cx = crate::init(Config::new().max_tasks(2).yield_iters(10)).unwrap();
        assert_ne!(cx.rt.key(), first);
        assert!(matches!(
            cx.dequeue_and_resume(&queue, None),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn foreign_queue_is_rejected() {
        let a = crate::init(Config::new().max_tasks(2).yield_iters(10)).unwrap();
        let b = crate::init(Config::new().max_tasks(2).yield_iters(10)).unwrap();
        let queue = TaskQueue::new();
        assert!(matches!(a.dequeue_and_resume(&queue, None), Err(Error::NoEntry)));
        assert!(matches!(
            b.dequeue_and_resume(&queue, None),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            b.suspend_and_enqueue(&queue),
            Err(Error::InvalidArgument)
        ));
    }
}

#[cfg(test)]
mod invariants;
