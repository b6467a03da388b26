use crate::{sleep::SyncPolicy, util::Backoff};
use std::{
    fmt,
    sync::atomic::{
        AtomicUsize,
        Ordering::{self, *},
    },
};

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's lifecycle state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct State<usize> {
        /// If set, this slot holds a task that has not yet been waited for.
        pub(crate) const ALIVE: bool;

        /// If set, the task is runnable or running: it is not suspended on a
        /// queue.
        pub(crate) const RUNNING: bool;

        /// If set, the task has asked to exit.
        pub(crate) const EXIT_REQUESTED: bool;

        /// If set, some context has claimed the right to record the exit
        /// status, and the status will not be overwritten.
        pub(crate) const STATUS_CLAIMED: bool;

        /// If set, the exit status recorded by the claimant is readable.
        pub(crate) const HAS_STATUS: bool;

        /// If set, the task has terminated and its OS threads are finishing.
        pub(crate) const EXITED: bool;

        /// The synchronization policy the task uses when it sleeps as a
        /// scheduling domain.
        pub(crate) const SYNC: SyncPolicy;
    }
}

/// An atomic cell that stores a task's current [`State`].
#[repr(transparent)]
pub(crate) struct StateCell(AtomicUsize);

impl State {
    /// The state of an unoccupied slot.
    pub(crate) const EMPTY: Self = Self(0);
}

// === impl StateCell ===

impl StateCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> State {
        State(self.0.load(order))
    }

    /// Claims an empty slot for a newly spawned task.
    ///
    /// Returns `false` if the slot was occupied.
    pub(crate) fn claim(&self, sync: SyncPolicy) -> bool {
        let next = State::new()
            .with(State::ALIVE, true)
            .with(State::RUNNING, true)
            .with(State::SYNC, sync);
        self.0
            .compare_exchange(State::EMPTY.0, next.0, AcqRel, Relaxed)
            .is_ok()
    }

    /// Marks the slot empty again.
    pub(crate) fn release(&self) {
        self.0.store(State::EMPTY.0, Release);
    }

    /// Clears `RUNNING`, returning `false` if the task was already suspended.
    pub(crate) fn try_suspend(&self) -> bool {
        self.transition(|state| {
            if !state.get(State::RUNNING) {
                return false;
            }
            state.set(State::RUNNING, false);
            true
        })
    }

    /// Sets `RUNNING`, returning `false` if the task was already running.
    ///
    /// Of two racing resumers, exactly one wins.
    pub(crate) fn try_run(&self) -> bool {
        self.transition(|state| {
            if state.get(State::RUNNING) {
                return false;
            }
            state.set(State::RUNNING, true);
            true
        })
    }

    pub(crate) fn request_exit(&self) {
        self.transition(|state| {
            state.set(State::EXIT_REQUESTED, true);
        })
    }

    /// Claims the right to record the exit status.
    ///
    /// Returns `true` exactly once per task. The claimant stores the status,
    /// then calls [`publish_status`](Self::publish_status).
    pub(crate) fn claim_status(&self) -> bool {
        self.transition(|state| {
            if state.get(State::STATUS_CLAIMED) {
                return false;
            }
            state.set(State::STATUS_CLAIMED, true);
            true
        })
    }

    pub(crate) fn publish_status(&self) {
        self.transition(|state| {
            state.set(State::HAS_STATUS, true);
        })
    }

    /// Marks the task as terminated.
    ///
    /// Returns `false` if it already was.
    pub(crate) fn set_exited(&self) -> bool {
        self.transition(|state| {
            if state.get(State::EXITED) {
                return false;
            }
            state.set(State::EXITED, true);
            true
        })
    }

    pub(crate) fn set_sync(&self, sync: SyncPolicy) {
        self.transition(|state| {
            state.set(State::SYNC, sync);
        })
    }

    #[inline]
    pub(crate) fn sync(&self) -> SyncPolicy {
        self.load(Acquire).get(State::SYNC)
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.load(Acquire).get(State::RUNNING)
    }

    #[inline]
    pub(crate) fn is_exit_requested(&self) -> bool {
        self.load(Acquire).get(State::EXIT_REQUESTED)
    }

    #[inline]
    pub(crate) fn is_exited(&self) -> bool {
        self.load(Acquire).get(State::EXITED)
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut State) -> T) -> T {
        let mut current = self.load(Acquire);
        let mut boff = Backoff::new();
        loop {
            let mut next = current;
            // Run the transition function.
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self
                .0
                .compare_exchange_weak(current.0, next.0, AcqRel, Acquire)
            {
                Ok(_) => return res,
                Err(actual) => {
                    current = State(actual);
                    boff.spin();
                }
            }
        }
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Relaxed).fmt(f)
    }
}
