//! Task queues.
//!
//! Every queue in the runtime is the same index-linked intrusive FIFO
//! ([`List`]): a task's queue linkage lives in its control block, so moving a
//! task between queues never allocates, and splicing one queue onto another
//! is O(1) regardless of length. A task's links can be on at most one list at
//! a time; linking a task that is already linked aborts the process.
//!
//! The list is wrapped three ways:
//!
//! - [`RunQueue`]: a domain's local ready list. It is not locked; only the
//!   domain's current executor may touch it.
//! - [`Inbox`]: a domain's out-of-domain queue, guarded by a spinlock, which
//!   any task may push to.
//! - [`TaskQueue`]: the public queue that tasks suspend themselves onto, and
//!   the building block of the [synchronization primitives](crate::sync).
use crate::{
    task::{Arena, AtomicTaskId, TaskId},
    Cx, Error,
};
use maitake_sync::{blocking::Mutex, spin::Spinlock};
use std::{
    cell::UnsafeCell,
    fmt, mem,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering::*},
};

/// Queue linkage embedded in every task control block.
pub(crate) struct Links {
    next: AtomicTaskId,
    prev: AtomicTaskId,
    linked: AtomicBool,
}

/// Resolves a [`TaskId`] to the [`Links`] embedded in its control block.
pub(crate) trait Linked {
    fn links(&self, id: TaskId) -> &Links;
}

/// An index-linked doubly-linked FIFO of tasks.
///
/// A `List` does not synchronize access to the links of the tasks it
/// contains: whoever has `&mut List` owns the links of every task on it.
#[derive(Debug, Default)]
pub(crate) struct List {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: usize,
}

/// Returned when pushing a task that is already on a list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct AlreadyLinked(pub(crate) TaskId);

/// A scheduling domain's local run queue.
pub(crate) struct RunQueue {
    list: UnsafeCell<List>,
    len: AtomicUsize,
}

/// A scheduling domain's out-of-domain queue.
pub(crate) struct Inbox {
    list: Mutex<List, Spinlock>,
    len: AtomicUsize,
}

/// A queue of suspended tasks.
///
/// Tasks suspend themselves onto a `TaskQueue` with
/// [`Cx::suspend_and_enqueue`], and are taken off it and made runnable again
/// with [`Cx::dequeue_and_resume`] or [`Cx::dequeue_and_resume_n`].
/// Alternatively, [`TaskQueue::dequeue`] takes a task off without resuming
/// it, to be resumed later with [`Cx::resume`]. A queue
/// is bound to the runtime of the first task that uses it; using it from
/// another runtime is an error.
///
/// [`Cx::suspend_and_enqueue`]: crate::Cx::suspend_and_enqueue
/// [`Cx::dequeue_and_resume`]: crate::Cx::dequeue_and_resume
/// [`Cx::dequeue_and_resume_n`]: crate::Cx::dequeue_and_resume_n
/// [`Cx::resume`]: crate::Cx::resume
pub struct TaskQueue {
    list: Mutex<List, Spinlock>,
    owner: AtomicUsize,
}

// === impl Links ===

impl Links {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicTaskId::none(),
            prev: AtomicTaskId::none(),
            linked: AtomicBool::new(false),
        }
    }

    pub(crate) fn reset(&self) {
        self.next.store(None, Relaxed);
        self.prev.store(None, Relaxed);
        self.linked.store(false, Release);
    }

    pub(crate) fn is_unlinked(&self) -> bool {
        !self.linked.load(Acquire)
    }

    fn next(&self) -> Option<TaskId> {
        self.next.load(Relaxed)
    }

    fn prev(&self) -> Option<TaskId> {
        self.prev.load(Relaxed)
    }

    fn set_next(&self, next: Option<TaskId>) {
        self.next.store(next, Relaxed)
    }

    fn set_prev(&self, prev: Option<TaskId>) {
        self.prev.store(prev, Relaxed)
    }
}

impl fmt::Debug for Links {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Links")
            .field("prev", &self.prev)
            .field("next", &self.next)
            .field("linked", &self.linked.load(Relaxed))
            .finish()
    }
}

impl Linked for Arena {
    #[inline]
    fn links(&self, id: TaskId) -> &Links {
        &self.get(id).links
    }
}

// === impl List ===

impl List {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn push_back(&mut self, nodes: &impl Linked, id: TaskId) -> Result<(), AlreadyLinked> {
        let links = nodes.links(id);
        if links.linked.swap(true, AcqRel) {
            return Err(AlreadyLinked(id));
        }

        links.set_next(None);
        links.set_prev(self.tail);
        match self.tail.replace(id) {
            Some(tail) => nodes.links(tail).set_next(Some(id)),
            None => self.head = Some(id),
        }
        self.len += 1;
        Ok(())
    }

    pub(crate) fn pop_front(&mut self, nodes: &impl Linked) -> Option<TaskId> {
        let head = self.head?;
        let links = nodes.links(head);
        self.head = links.next();
        match self.head {
            Some(next) => nodes.links(next).set_prev(None),
            None => self.tail = None,
        }
        self.len -= 1;
        links.reset();
        Some(head)
    }

    /// Removes `id` from this list, returning `false` if it is not on it.
    ///
    /// This walks the list, so it is O(n).
    pub(crate) fn remove(&mut self, nodes: &impl Linked, id: TaskId) -> bool {
        if !self.iter(nodes).any(|node| node == id) {
            return false;
        }

        let links = nodes.links(id);
        let (prev, next) = (links.prev(), links.next());
        match prev {
            Some(prev) => nodes.links(prev).set_next(next),
            None => self.head = next,
        }
        match next {
            Some(next) => nodes.links(next).set_prev(prev),
            None => self.tail = prev,
        }
        self.len -= 1;
        links.reset();
        true
    }

    /// Moves every task on `other` to the back of this list.
    pub(crate) fn append(&mut self, nodes: &impl Linked, other: &mut List) {
        let other = mem::take(other);
        let Some(other_head) = other.head else {
            return;
        };

        match self.tail {
            Some(tail) => {
                nodes.links(tail).set_next(Some(other_head));
                nodes.links(other_head).set_prev(Some(tail));
            }
            None => self.head = Some(other_head),
        }
        self.tail = other.tail;
        self.len += other.len;
    }

    pub(crate) fn iter<'a>(&self, nodes: &'a impl Linked) -> impl Iterator<Item = TaskId> + 'a {
        let mut curr = self.head;
        std::iter::from_fn(move || {
            let node = curr?;
            curr = nodes.links(node).next();
            Some(node)
        })
    }

    #[cfg(test)]
    pub(crate) fn assert_valid(&self, nodes: &impl Linked) {
        let Some(head) = self.head else {
            assert!(
                self.tail.is_none(),
                "if the list's head is none, the tail must also be none"
            );
            assert_eq!(self.len, 0, "an empty list must have length 0");
            return;
        };

        assert_eq!(nodes.links(head).prev(), None, "head node must not have a prev link");
        let mut prev = None;
        let mut len = 0;
        for node in self.iter(nodes) {
            let links = nodes.links(node);
            assert!(!links.is_unlinked(), "{node:?} is on a list but not marked linked");
            assert_eq!(links.prev(), prev, "{node:?} has the wrong prev link");
            prev = Some(node);
            len += 1;
        }
        assert_eq!(prev, self.tail, "the last node must be the tail");
        assert_eq!(len, self.len, "length must match the number of nodes");
    }
}

// === impl RunQueue ===

// Safety: the list is only ever accessed by the current executor of the
// domain that owns it, and executorship is handed between threads through
// the context switcher, which synchronizes.
unsafe impl Sync for RunQueue {}

impl RunQueue {
    pub(crate) const fn new() -> Self {
        Self {
            list: UnsafeCell::new(List::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// The number of runnable tasks. May be read from any thread.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Acquire)
    }

    /// # Safety
    ///
    /// The caller must be the current executor of the domain that owns this
    /// run queue.
    unsafe fn with<T>(&self, f: impl FnOnce(&mut List) -> T) -> T {
        let list = &mut *self.list.get();
        let res = f(list);
        self.len.store(list.len(), Release);
        res
    }

    /// # Safety
    ///
    /// The caller must be the current executor of the domain that owns this
    /// run queue.
    pub(crate) unsafe fn push_back(&self, tasks: &Arena, id: TaskId) {
        tracing::trace!(task.id = %id, "RunQueue::push_back");
        if let Err(AlreadyLinked(id)) = self.with(|list| list.push_back(tasks, id)) {
            fatal!(tasks, "task {id} pushed onto a run queue while already queued");
        }
    }

    /// # Safety
    ///
    /// The caller must be the current executor of the domain that owns this
    /// run queue.
    pub(crate) unsafe fn pop_front(&self, tasks: &Arena) -> Option<TaskId> {
        let id = self.with(|list| list.pop_front(tasks));
        tracing::trace!(task.id = ?id, "RunQueue::pop_front");
        id
    }

    /// # Safety
    ///
    /// The caller must be the current executor of the domain that owns this
    /// run queue.
    pub(crate) unsafe fn remove(&self, tasks: &Arena, id: TaskId) -> bool {
        self.with(|list| list.remove(tasks, id))
    }

    /// Moves up to `n` tasks (all, if `None`) off the front of this run
    /// queue, handing each to `f`.
    ///
    /// # Safety
    ///
    /// The caller must be the current executor of the domain that owns this
    /// run queue.
    pub(crate) unsafe fn drain(&self, tasks: &Arena, n: Option<usize>, mut f: impl FnMut(TaskId)) -> usize {
        self.with(|list| {
            let mut moved = 0;
            while n.map_or(true, |n| moved < n) {
                let Some(id) = list.pop_front(tasks) else {
                    break;
                };
                f(id);
                moved += 1;
            }
            moved
        })
    }

    /// # Safety
    ///
    /// As for [`RunQueue::push_back`].
    #[cfg(test)]
    pub(crate) unsafe fn snapshot(&self, tasks: &Arena) -> Vec<TaskId> {
        self.with(|list| list.iter(tasks).collect())
    }
}

impl fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunQueue").field("len", &self.len()).finish()
    }
}

// === impl Inbox ===

impl Inbox {
    pub(crate) const fn new() -> Self {
        Self {
            list: Mutex::new_with_raw_mutex(List::new(), Spinlock::new()),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(SeqCst)
    }

    /// Pushes a task onto the inbox, returning `true` if the inbox was
    /// empty.
    pub(crate) fn push(&self, tasks: &Arena, id: TaskId) -> bool {
        let mut list = self.list.lock();
        if let Err(AlreadyLinked(id)) = list.push_back(tasks, id) {
            drop(list);
            fatal!(tasks, "task {id} pushed onto an inbox while already queued");
        }
        let was_empty = self.len.fetch_add(1, SeqCst) == 0;
        tracing::trace!(task.id = %id, was_empty, "Inbox::push");
        was_empty
    }

    /// Splices the entire inbox onto the back of `run_queue`.
    ///
    /// Returns `true` if the run queue is non-empty afterwards.
    ///
    /// # Safety
    ///
    /// The caller must be the current executor of the domain that owns both
    /// queues.
    pub(crate) unsafe fn take_into(&self, tasks: &Arena, run_queue: &RunQueue) -> bool {
        let mut list = self.list.lock();
        if !list.is_empty() {
            let moved = list.len();
            run_queue.with(|run| run.append(tasks, &mut list));
            self.len.store(0, SeqCst);
            tracing::trace!(moved, "Inbox::take_into");
        }
        drop(list);
        run_queue.len() > 0
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self, tasks: &Arena) -> Vec<TaskId> {
        self.list.lock().iter(tasks).collect()
    }
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox").field("len", &self.len()).finish()
    }
}

// === impl TaskQueue ===

impl TaskQueue {
    const UNBOUND: usize = 0;

    /// Returns a new, empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            list: Mutex::new_with_raw_mutex(List::new(), Spinlock::new()),
            owner: AtomicUsize::new(Self::UNBOUND),
        }
    }

    /// Returns the number of tasks suspended on this queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Returns `true` if no task is suspended on this queue.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Binds this queue to the runtime identified by `owner`, or checks that
    /// it already is.
    pub(crate) fn bind(&self, owner: usize) -> Result<(), Error> {
        match self
            .owner
            .compare_exchange(Self::UNBOUND, owner, AcqRel, Acquire)
        {
            Ok(_) => Ok(()),
            Err(actual) if actual == owner => Ok(()),
            Err(_) => Err(Error::InvalidArgument),
        }
    }

    /// Takes the first task off this queue without resuming it.
    ///
    /// The task stays suspended, and still counts as a dependent of the
    /// domain it was suspended from, until it is passed to [`Cx::resume`].
    /// Returns `Ok(None)` if the queue is empty.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the queue belongs to another runtime.
    ///
    /// [`Cx::resume`]: crate::Cx::resume
    pub fn dequeue(&self, cx: &Cx) -> Result<Option<TaskId>, Error> {
        let rt = &*cx.rt;
        self.bind(rt.key())?;
        let id = self.pop(&rt.tasks);
        tracing::trace!(task.id = ?id, "TaskQueue::dequeue");
        Ok(id)
    }

    pub(crate) fn push(&self, tasks: &Arena, id: TaskId) {
        let mut list = self.list.lock();
        if let Err(AlreadyLinked(id)) = list.push_back(tasks, id) {
            drop(list);
            fatal!(tasks, "task {id} suspended onto a queue while already queued");
        }
    }

    pub(crate) fn pop(&self, tasks: &Arena) -> Option<TaskId> {
        self.list.lock().pop_front(tasks)
    }

    /// Moves up to `n` tasks (all, if `None`) from the front of this queue
    /// into `into`, under a single acquisition of the lock.
    pub(crate) fn take(&self, tasks: &Arena, n: Option<usize>, into: &mut List) -> usize {
        let mut list = self.list.lock();
        let mut moved = 0;
        while n.map_or(true, |n| moved < n) {
            let Some(id) = list.pop_front(tasks) else {
                break;
            };
            // `id` was just unlinked, so this cannot fail
            let _ = into.push_back(tasks, id);
            moved += 1;
        }
        moved
    }

    /// Runs `f` with the queue locked.
    pub(crate) fn with_locked<T>(&self, f: impl FnOnce(&mut List) -> T) -> T {
        f(&mut self.list.lock())
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self, tasks: &Arena) -> Vec<TaskId> {
        self.list.lock().iter(tasks).collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .field("bound", &(self.owner.load(Relaxed) != Self::UNBOUND))
            .finish()
    }
}
