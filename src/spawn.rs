//! Spawning tasks and collecting their exit status.
//!
//! A new task is its own scheduling domain, running on a fresh execution
//! context. [`Cx::spawn`] starts one with the default settings;
//! [`Cx::build_task`] returns a [`Builder`] for naming the task, choosing its
//! synchronization policy, or choosing how it starts.
//!
//! Once a task has terminated, some other task collects its status with
//! [`Cx::wait`] (or [`Cx::wait_any`], for whichever task terminates first),
//! which also returns its slot to the runtime.
use crate::{
    context::ContextSwitch,
    sched::{Cx, Runtime, Yield},
    sleep::{Semaphore, SyncPolicy},
    task::Task,
    Error, TaskId, TaskQueue,
};
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

/// Configures a task before it is spawned.
///
/// Returned by [`Cx::build_task`].
#[must_use = "a Builder does nothing until `spawn` is called"]
pub struct Builder<'cx> {
    cx: &'cx Cx,
    name: Option<String>,
    sync_policy: Option<SyncPolicy>,
    start: Start,
}

enum Start {
    /// Run the body immediately.
    Run,
    /// Suspend onto the queue before running the body.
    Inactive(Arc<TaskQueue>),
    /// Resume every task on the queue into the new domain, then run the body.
    Adopt(Arc<TaskQueue>),
}

/// The unwind payload of [`Cx::exit`].
///
/// The status has already been recorded by the time this is thrown.
pub(crate) struct ExitUnwind;

/// The status of a task whose body panicked.
const PANIC_STATUS: i32 = 101;

/// How long a waiter with nothing else to run parks before checking its
/// domain for new work again.
const WAIT_PARK: Duration = Duration::from_millis(1);

// === impl Builder ===

impl<'cx> Builder<'cx> {
    fn new(cx: &'cx Cx) -> Self {
        Self {
            cx,
            name: None,
            sync_policy: None,
            start: Start::Run,
        }
    }

    /// Names the task.
    ///
    /// The name shows up in [`TaskInfo`](crate::TaskInfo), diagnostics, and
    /// as the name of the task's OS thread.
    pub fn name(self, name: &str) -> Self {
        Self {
            name: Some(name.to_owned()),
            ..self
        }
    }

    /// Sets the synchronization policy the task uses when it sleeps as a
    /// scheduling domain.
    ///
    /// Defaults to the runtime's [`Config::sync_policy`](crate::Config::sync_policy).
    pub fn sync_policy(self, policy: SyncPolicy) -> Self {
        Self {
            sync_policy: Some(policy),
            ..self
        }
    }

    /// Starts the task suspended on `queue`.
    ///
    /// The task's body runs once another task dequeues and resumes it.
    pub fn inactive(self, queue: Arc<TaskQueue>) -> Self {
        Self {
            start: Start::Inactive(queue),
            ..self
        }
    }

    /// Has the task resume every task suspended on `queue` into its own
    /// scheduling domain before its body runs.
    pub fn adopt(self, queue: Arc<TaskQueue>) -> Self {
        Self {
            start: Start::Adopt(queue),
            ..self
        }
    }

    /// Spawns the task, returning its ID.
    ///
    /// The returned task is already running (or suspended on its queue, if
    /// started [inactive](Self::inactive)). The body's return value is the
    /// task's exit status; a body that panics exits with status 101.
    ///
    /// # Errors
    ///
    /// - [`Error::Overflow`] if every task slot is in use.
    /// - [`Error::Spawn`] if the OS refused to start a thread.
    /// - [`Error::InvalidArgument`] if the start queue belongs to another
    ///   runtime.
    pub fn spawn<F>(self, body: F) -> Result<TaskId, Error>
    where
        F: FnOnce(&Cx) -> i32 + Send + 'static,
    {
        let rt = &self.cx.rt;
        if let Start::Inactive(ref queue) | Start::Adopt(ref queue) = self.start {
            queue.bind(rt.key())?;
        }

        let sync = self.sync_policy.unwrap_or(rt.config.sync_policy);
        let task = rt.tasks.claim(self.name.clone(), sync)?;
        let id = task.id;
        let thread_name = self.name.unwrap_or_else(|| format!("hyphae-task-{id}"));

        let started = Arc::new(Semaphore::default());
        let entry = {
            let rt = rt.clone();
            let started = started.clone();
            let start = self.start;
            move || run_task(rt, id, start, &started, body)
        };
        match rt.switch.spawn(thread_name, entry) {
            Ok(handle) => task.set_body(handle),
            Err(error) => {
                tracing::warn!(task.id = %id, %error, "failed to spawn task");
                rt.tasks.release(id);
                return Err(Error::Spawn(error));
            }
        }

        started.wait();
        tracing::debug!(task.id = %id, parent = %self.cx.id(), "spawned task");
        Ok(id)
    }
}

impl fmt::Debug for Builder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = match self.start {
            Start::Run => "run",
            Start::Inactive(_) => "inactive",
            Start::Adopt(_) => "adopt",
        };
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("sync_policy", &self.sync_policy)
            .field("start", &start)
            .finish()
    }
}

/// The entry point of every spawned task's body.
fn run_task<F>(rt: Arc<Runtime>, id: TaskId, start: Start, started: &Semaphore, body: F)
where
    F: FnOnce(&Cx) -> i32,
{
    let cx = Cx::new(rt.clone(), id);
    let _span = tracing::debug_span!("task", task.id = %id).entered();

    match start {
        Start::Run => started.post(),
        Start::Inactive(queue) => {
            // the spawner may return as soon as we are findable on the queue
            if let Err(error) = rt.suspend_and_enqueue(id, &queue, || started.post()) {
                fatal!(&rt.tasks, "new task {id} could not suspend: {error}");
            }
        }
        Start::Adopt(queue) => {
            match cx.dequeue_and_resume_n(&queue, Some(id), None) {
                Ok(adopted) => tracing::debug!(adopted, "adopted tasks"),
                Err(error) => tracing::warn!(%error, "failed to adopt tasks"),
            }
            started.post();
        }
    }

    let status = match panic::catch_unwind(AssertUnwindSafe(|| body(&cx))) {
        Ok(status) => status,
        Err(payload) if payload.is::<ExitUnwind>() => {
            // `Cx::exit` recorded the status before unwinding
            rt.task(id).status().unwrap_or_default()
        }
        Err(payload) => {
            tracing::warn!(panic = panic_message(&*payload), "task body panicked");
            PANIC_STATUS
        }
    };
    rt.task(id).set_status(status);
    rt.do_exit(id);
    tracing::trace!("task body returning");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

// === impl Cx ===

impl Cx {
    /// Returns a [`Builder`] for configuring a new task.
    pub fn build_task(&self) -> Builder<'_> {
        Builder::new(self)
    }

    /// Spawns a new task running `body`, as its own scheduling domain.
    ///
    /// See [`Builder::spawn`].
    pub fn spawn<F>(&self, body: F) -> Result<TaskId, Error>
    where
        F: FnOnce(&Cx) -> i32 + Send + 'static,
    {
        self.build_task().spawn(body)
    }

    /// Waits for a task to terminate, returning its exit status.
    ///
    /// While it waits, the caller keeps yielding to the rest of its domain;
    /// once there is nothing else to run, it parks until some task
    /// terminates. Once the task has terminated, its execution contexts are
    /// joined and its slot is returned to the runtime, so each task can be
    /// waited for only once.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `id` is the root task, the caller, a
    ///   free slot, or a task that has already been waited for.
    pub fn wait(&self, id: TaskId) -> Result<i32, Error> {
        let task = self.waitable(id)?;
        let _span = tracing::debug_span!("wait", task.id = %self.id(), target = %id).entered();
        self.wait_until(|| task.state.is_exited());
        self.reap(id)
    }

    /// Collects a task's exit status if it has already terminated.
    ///
    /// Returns `Ok(None)` without blocking if it has not.
    ///
    /// # Errors
    ///
    /// As for [`Cx::wait`].
    pub fn try_wait(&self, id: TaskId) -> Result<Option<i32>, Error> {
        if !self.waitable(id)?.state.is_exited() {
            return Ok(None);
        }
        self.reap(id).map(Some)
    }

    /// Waits for any other task to terminate, returning its ID and exit
    /// status.
    ///
    /// The root task is never waited for. Tasks are collected as by
    /// [`Cx::wait`].
    ///
    /// # Errors
    ///
    /// - [`Error::NoChild`] if no other task is left to wait for.
    pub fn wait_any(&self) -> Result<(TaskId, i32), Error> {
        let _span = tracing::debug_span!("wait_any", task.id = %self.id()).entered();
        let mut reaped = None;
        let mut error = None;
        self.wait_until(|| match self.try_wait_any() {
            Ok(Some(done)) => {
                reaped = Some(done);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error = Some(e);
                true
            }
        });
        match (reaped, error) {
            (Some(done), _) => Ok(done),
            (None, Some(error)) => Err(error),
            (None, None) => Err(Error::NoChild),
        }
    }

    /// Collects the status of any other task that has already terminated.
    ///
    /// Returns `Ok(None)` without blocking if every other task is still
    /// running.
    ///
    /// # Errors
    ///
    /// - [`Error::NoChild`] if no other task is left to wait for.
    pub fn try_wait_any(&self) -> Result<Option<(TaskId, i32)>, Error> {
        let mut any = false;
        for task in self.rt.tasks.live() {
            let id = task.id;
            if id == TaskId::ROOT || id == self.id() {
                continue;
            }
            any = true;
            if !task.state.is_exited() {
                continue;
            }
            // another waiter may have collected it first
            if let Ok(status) = self.reap(id) {
                return Ok(Some((id, status)));
            }
        }
        if any {
            Ok(None)
        } else {
            Err(Error::NoChild)
        }
    }

    /// Yields, then parks, until `done` returns `true`.
    fn wait_until(&self, mut done: impl FnMut() -> bool) {
        let exits = &self.rt.exits;
        while !done() {
            if self.yield_now() == Yield::Idle {
                // read the epoch before checking again, so that a task
                // terminating in between still wakes us
                let seen = exits.epoch();
                if done() {
                    return;
                }
                exits.wait_for(seen, WAIT_PARK);
            }
        }
    }

    fn waitable(&self, id: TaskId) -> Result<&Task, Error> {
        if id == TaskId::ROOT || id == self.id() {
            return Err(Error::InvalidArgument);
        }
        self.rt.tasks.lookup(id)
    }

    fn reap(&self, id: TaskId) -> Result<i32, Error> {
        let rt = &*self.rt;
        let task = rt.task(id);
        // only one waiter gets the body handle
        let Some(body) = task.take_body() else {
            return Err(Error::InvalidArgument);
        };
        if !rt.switch.join(body) {
            tracing::warn!(task.id = %id, "task thread terminated abnormally");
        }
        if let Some(sleeper) = task.sleeper.take_thread() {
            if !rt.switch.join(sleeper) {
                tracing::warn!(task.id = %id, "sleep context terminated abnormally");
            }
        }

        let status = task.status().unwrap_or(PANIC_STATUS);
        rt.tasks.release(id);
        tracing::debug!(task.id = %id, status, "reaped task");
        Ok(status)
    }
}
