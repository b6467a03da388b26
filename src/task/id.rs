use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

/// Identifies a task within a runtime.
///
/// A `TaskId` is a small integer naming a slot in the runtime's task arena.
/// It is stable for the lifetime of the task it names. Once a terminated task
/// has been [waited] for, its slot (and therefore its `TaskId`) may be reused
/// by a newly spawned task.
///
/// The root task, created by [`hyphae::init`](crate::init), is always
/// [`TaskId::ROOT`].
///
/// [waited]: crate::Cx::wait
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TaskId(u32);

/// An atomic `Option<TaskId>`.
///
/// Used for every "pointer" from one task control block to another: queue
/// links, the scheduling domain back-reference, the deferred wakeup slot.
pub(crate) struct AtomicTaskId(AtomicU32);

impl TaskId {
    /// The root task's ID.
    pub const ROOT: Self = Self(0);

    const NONE: u32 = u32::MAX;

    #[inline]
    pub(crate) const fn from_index(index: usize) -> Self {
        debug_assert!(index < Self::NONE as usize);
        Self(index as u32)
    }

    /// Returns the numeric value of this ID.
    #[must_use]
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    fn from_raw(raw: u32) -> Option<Self> {
        if raw == Self::NONE {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[inline]
    fn into_raw(id: Option<Self>) -> u32 {
        match id {
            Some(Self(raw)) => raw,
            None => Self::NONE,
        }
    }
}

/// Any `u32` converts to a `TaskId`; operations given an ID that does not
/// name a live task fail with [`Error::InvalidArgument`](crate::Error::InvalidArgument).
impl From<u32> for TaskId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for TaskId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskId(")?;
        fmt::Debug::fmt(&self.0, f)?;
        f.write_str(")")
    }
}

impl fmt::Display for TaskId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// === impl AtomicTaskId ===

impl AtomicTaskId {
    pub(crate) const fn none() -> Self {
        Self(AtomicU32::new(TaskId::NONE))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> Option<TaskId> {
        TaskId::from_raw(self.0.load(order))
    }

    #[inline]
    pub(crate) fn store(&self, id: Option<TaskId>, order: Ordering) {
        self.0.store(TaskId::into_raw(id), order)
    }

    #[inline]
    pub(crate) fn take(&self, order: Ordering) -> Option<TaskId> {
        TaskId::from_raw(self.0.swap(TaskId::NONE, order))
    }

    /// Stores `id` only if the slot is currently empty.
    ///
    /// Returns the occupant on failure.
    #[inline]
    pub(crate) fn try_fill(&self, id: TaskId, order: Ordering) -> Result<(), TaskId> {
        self.0
            .compare_exchange(TaskId::NONE, id.0, order, Ordering::Relaxed)
            .map(|_| ())
            .map_err(TaskId)
    }
}

impl fmt::Debug for AtomicTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.load(Ordering::Relaxed) {
            Some(id) => fmt::Debug::fmt(&id, f),
            None => f.write_str("None"),
        }
    }
}
