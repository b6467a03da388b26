//! Task control blocks.
//!
//! This module contains the in-memory representation of a task (the [`Task`]
//! control block), the fixed-capacity [`Arena`] that owns every control
//! block in a runtime, and the [`TaskId`] used everywhere else to refer to a
//! task. Control blocks never point at each other directly: every reference
//! from one task to another (queue links, the scheduling domain, the
//! deferred wakeup slot) is a `TaskId`, resolved through the arena.
use crate::{
    context::{Context, Handle, Handoff, SleepContext, StackGuard},
    queue::{Inbox, Links, RunQueue},
    sleep::{Sleep, SyncPolicy},
    util::CachePadded,
    Error,
};
use maitake_sync::{blocking::Mutex, spin::Spinlock};
use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicI32, AtomicIsize, Ordering::*},
        Arc,
    },
};

mod id;
mod state;

pub use self::id::TaskId;
pub(crate) use self::id::AtomicTaskId;
use self::state::{State, StateCell};

/// A task control block.
pub(crate) struct Task {
    pub(crate) id: TaskId,

    pub(crate) state: StateCell,

    /// The exit status, valid once `HAS_STATUS` is set.
    status: AtomicI32,

    /// The number of suspended tasks that will resume in this task's
    /// scheduling domain.
    ///
    /// A domain may only terminate once this reaches zero.
    pub(crate) refcount: AtomicIsize,

    /// The task currently acting as this task's scheduling domain.
    pub(crate) sched: AtomicTaskId,

    /// The domain this task left when it coupled, if it is coupled.
    pub(crate) coupled: AtomicTaskId,

    /// When this task acts as a domain, the task it is currently running
    /// (`None` while the domain sleeps).
    pub(crate) current: AtomicTaskId,

    /// Linkage into whichever queue this task is on.
    pub(crate) links: Links,

    /// The domain's local run queue.
    pub(crate) run_queue: RunQueue,

    /// The domain's out-of-domain queue.
    pub(crate) inbox: CachePadded<Inbox>,

    /// The domain's wakeup state.
    pub(crate) sleep: Sleep,

    /// Where this task's body resumes.
    pub(crate) ctx: Context,

    /// Stack-protection and deferred-wakeup slots for switches into `ctx`.
    pub(crate) handoff: Handoff,

    pub(crate) stack: StackGuard,

    /// The domain's parked context, started on first use.
    pub(crate) sleeper: SleepContext,

    meta: Mutex<Meta, Spinlock>,
}

#[derive(Default)]
struct Meta {
    name: Option<String>,
    body: Option<Handle>,
    aux: Option<Aux>,
}

/// A value attached to a task with [`Cx::set_aux`](crate::Cx::set_aux).
pub(crate) type Aux = Arc<dyn Any + Send + Sync>;

/// The fixed-capacity set of task control blocks owned by a runtime.
pub(crate) struct Arena {
    slots: Box<[Task]>,
}

/// A snapshot of a task's scheduling state.
///
/// Returned by [`Cx::info`](crate::Cx::info). The values are read without
/// synchronizing with the task, so they may be stale by the time they are
/// inspected.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TaskInfo {
    /// The task's ID.
    pub id: TaskId,
    /// The task's name, if it was given one.
    pub name: Option<String>,
    /// The task's current scheduling domain.
    pub domain: TaskId,
    /// The domain the task left when it coupled, if it is coupled.
    pub coupled: Option<TaskId>,
    /// Whether the task is running or runnable (not suspended on a queue).
    pub running: bool,
    /// Whether the task has asked to exit.
    pub exit_requested: bool,
    /// Whether the task has terminated.
    pub exited: bool,
    /// The task's exit status, once recorded.
    pub status: Option<i32>,
    /// The number of suspended tasks that will resume in this task's domain.
    pub refcount: isize,
    /// The length of this task's run queue, as a domain.
    pub runnable: usize,
    /// The length of this task's out-of-domain queue, as a domain.
    pub inbox: usize,
    /// The task's synchronization policy.
    pub sync_policy: SyncPolicy,
}

// === impl Task ===

impl Task {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            state: StateCell::new(),
            status: AtomicI32::new(0),
            refcount: AtomicIsize::new(0),
            sched: AtomicTaskId::none(),
            coupled: AtomicTaskId::none(),
            current: AtomicTaskId::none(),
            links: Links::new(),
            run_queue: RunQueue::new(),
            inbox: CachePadded::new(Inbox::new()),
            sleep: Sleep::new(SyncPolicy::default()),
            ctx: Context::default(),
            handoff: Handoff::new(),
            stack: StackGuard::new(),
            sleeper: SleepContext::new(),
            meta: Mutex::new_with_raw_mutex(Meta::default(), Spinlock::new()),
        }
    }

    /// Resets a freshly claimed slot so that the task is its own scheduling
    /// domain.
    fn reset(&self, name: Option<String>, sync: SyncPolicy) {
        self.status.store(0, Relaxed);
        self.refcount.store(0, Relaxed);
        self.sched.store(Some(self.id), Relaxed);
        self.coupled.store(None, Relaxed);
        self.current.store(Some(self.id), Relaxed);
        self.links.reset();
        self.sleep.reset(sync);
        self.handoff.reset();
        self.stack.reset();
        self.sleeper.reset();
        *self.meta.lock() = Meta {
            name,
            ..Meta::default()
        };
    }

    #[inline]
    pub(crate) fn sched(&self) -> TaskId {
        // every live task has a domain, even if it is itself
        self.sched.load(Acquire).unwrap_or(self.id)
    }

    /// Records the exit status, unless one has already been recorded.
    pub(crate) fn set_status(&self, status: i32) -> bool {
        if !self.state.claim_status() {
            return false;
        }
        // readers only look at the value once `HAS_STATUS` is set
        self.status.store(status, Release);
        self.state.publish_status();
        true
    }

    pub(crate) fn status(&self) -> Option<i32> {
        let state = self.state.load(Acquire);
        if state.get(State::HAS_STATUS) {
            Some(self.status.load(Acquire))
        } else {
            None
        }
    }

    /// A domain may terminate once its exit has been requested and it no
    /// longer has any task to schedule.
    pub(crate) fn able_to_terminate(&self) -> bool {
        // the refcount must be read before the inbox: a resumer publishes
        // the task in the inbox before dropping its reference
        self.state.is_exit_requested()
            && self.refcount.load(SeqCst) == 0
            && self.inbox.len() == 0
    }

    pub(crate) fn name(&self) -> Option<String> {
        self.meta.lock().name.clone()
    }

    pub(crate) fn set_body(&self, handle: Handle) {
        self.meta.lock().body = Some(handle);
    }

    pub(crate) fn take_body(&self) -> Option<Handle> {
        self.meta.lock().body.take()
    }

    /// Replaces the task's auxiliary value, returning the old one.
    pub(crate) fn replace_aux(&self, aux: Option<Aux>) -> Option<Aux> {
        std::mem::replace(&mut self.meta.lock().aux, aux)
    }

    pub(crate) fn aux(&self) -> Option<Aux> {
        self.meta.lock().aux.clone()
    }

    pub(crate) fn info(&self) -> TaskInfo {
        let state = self.state.load(Acquire);
        TaskInfo {
            id: self.id,
            name: self.name(),
            domain: self.sched(),
            coupled: self.coupled.load(Acquire),
            running: state.get(State::RUNNING),
            exit_requested: state.get(State::EXIT_REQUESTED),
            exited: state.get(State::EXITED),
            status: self.status(),
            refcount: self.refcount.load(Acquire),
            runnable: self.run_queue.len(),
            inbox: self.inbox.len(),
            sync_policy: state.get(State::SYNC),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("sched", &self.sched)
            .field("coupled", &self.coupled)
            .field("current", &self.current)
            .field("refcount", &self.refcount.load(Relaxed))
            .field("runnable", &self.run_queue.len())
            .field("inbox", &self.inbox.len())
            .field("stack", &self.stack)
            .field("handoff", &self.handoff)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

// === impl Arena ===

impl Arena {
    pub(crate) fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|index| Task::new(TaskId::from_index(index)))
            .collect();
        Self { slots }
    }

    /// Returns the control block for an ID handed out by this arena.
    #[inline]
    pub(crate) fn get(&self, id: TaskId) -> &Task {
        &self.slots[id.index()]
    }

    /// Returns the control block for a caller-supplied ID.
    pub(crate) fn lookup(&self, id: TaskId) -> Result<&Task, Error> {
        match self.slots.get(id.index()) {
            Some(task) if task.state.load(Acquire).get(State::ALIVE) => Ok(task),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Claims a free slot.
    pub(crate) fn claim(&self, name: Option<String>, sync: SyncPolicy) -> Result<&Task, Error> {
        let task = self
            .slots
            .iter()
            .find(|task| task.state.claim(sync))
            .ok_or(Error::Overflow)?;
        task.reset(name, sync);
        tracing::trace!(task.id = %task.id, "claimed task slot");
        Ok(task)
    }

    /// Returns a slot to the free pool.
    pub(crate) fn release(&self, id: TaskId) {
        let task = self.get(id);
        debug_assert!(task.links.is_unlinked());
        *task.meta.lock() = Meta::default();
        task.state.release();
        tracing::trace!(task.id = %id, "released task slot");
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = &Task> + '_ {
        self.slots
            .iter()
            .filter(|task| task.state.load(Relaxed).get(State::ALIVE))
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.live()).finish()
    }
}
