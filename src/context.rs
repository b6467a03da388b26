//! The context switcher.
//!
//! A *context* is a point where a suspended task (or a sleeping scheduling
//! domain) will resume. The [`ContextSwitch`] trait is the only part of the
//! runtime that knows how contexts are represented; everything above it
//! transfers control with three primitives:
//!
//! - **swap**: from one task's body straight into another's;
//! - **decouple-switch**: from a task into its domain's sleep context, which
//!   is started on first use;
//! - **couple-switch**: from a domain's sleep context into a task.
//!
//! # Stack protection
//!
//! A context that is being switched away from is still running until the
//! switch completes, so it must not be resumed by anyone else until then.
//! Before switching, the outgoing task marks its [`StackGuard`] as protected
//! and records itself in the incoming context's [`Handoff`] slot. The
//! incoming context clears the guard as the first thing it does after it
//! resumes. Anyone about to switch *into* a task first waits for the task's
//! guard to clear: briefly spinning, then yielding for a bounded number of
//! rounds. A guard that never clears means two contexts can no longer make
//! progress, which is reported as a fatal error rather than left to hang.
use crate::{
    sched::Runtime,
    task::{AtomicTaskId, TaskId},
    util::{fence, pause},
};
use maitake_sync::{blocking::Mutex, spin::Spinlock};
use std::{
    fmt, io,
    sync::atomic::{AtomicBool, Ordering::*},
};

mod thread;
pub use self::thread::{Permit, ThreadSwitch};

/// Saves and restores execution contexts.
///
/// Implementations provide the context representation; the runtime provides
/// all of the scheduling. Every operation is called with the runtime's
/// invariants already established: a context is only resumed by one party,
/// and only once per suspension.
pub trait ContextSwitch: Send + Sync + 'static {
    /// A resumption point.
    type Context: Default + Send + Sync + fmt::Debug;

    /// A handle to a started context's underlying execution resource.
    type Handle: Send + Sync + 'static;

    /// Resumes `to`, and suspends the caller in `from` until `from` is
    /// resumed.
    fn switch(&self, from: &Self::Context, to: &Self::Context);

    /// Resumes `to` without suspending the caller.
    fn resume(&self, to: &Self::Context);

    /// Suspends the caller in `ctx` until it is resumed.
    fn suspend(&self, ctx: &Self::Context);

    /// Starts a new execution resource running `entry`.
    ///
    /// `entry` is expected to [`suspend`](Self::suspend) itself before doing
    /// anything that needs to be scheduled.
    fn spawn<F>(&self, name: String, entry: F) -> io::Result<Self::Handle>
    where
        F: FnOnce() + Send + 'static;

    /// Waits for a started execution resource to finish.
    ///
    /// Returns `false` if it finished abnormally.
    fn join(&self, handle: Self::Handle) -> bool;
}

pub(crate) type Switch = ThreadSwitch;
pub(crate) type Context = <Switch as ContextSwitch>::Context;
pub(crate) type Handle = <Switch as ContextSwitch>::Handle;

/// The slots a switch into a context uses to pass state to it.
pub(crate) struct Handoff {
    /// The task whose stack guard the context clears when it resumes.
    release: AtomicTaskId,
    /// A task to wake when the context resumes.
    deferred: AtomicTaskId,
}

/// Marks a task's stack as still in use by an unfinished switch.
pub(crate) struct StackGuard {
    protected: AtomicBool,
}

/// A scheduling domain's parked context, where it runs its sleep loop.
pub(crate) struct SleepContext {
    pub(crate) ctx: Context,
    pub(crate) handoff: Handoff,
    started: AtomicBool,
    thread: Mutex<Option<Handle>, Spinlock>,
}

/// The stack-protection wait gave up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct StackWaitTimeout {
    pub(crate) task: TaskId,
    pub(crate) rounds: usize,
}

// === impl Handoff ===

impl Handoff {
    pub(crate) const fn new() -> Self {
        Self {
            release: AtomicTaskId::none(),
            deferred: AtomicTaskId::none(),
        }
    }

    pub(crate) fn reset(&self) {
        self.release.store(None, Release);
        self.deferred.store(None, Release);
    }
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("release", &self.release)
            .field("deferred", &self.deferred)
            .finish()
    }
}

// === impl StackGuard ===

impl StackGuard {
    pub(crate) const fn new() -> Self {
        Self {
            protected: AtomicBool::new(false),
        }
    }

    pub(crate) fn reset(&self) {
        self.protected.store(false, Release);
    }

    #[inline]
    pub(crate) fn is_protected(&self) -> bool {
        self.protected.load(SeqCst)
    }
}

impl fmt::Debug for StackGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackGuard")
            .field("protected", &self.is_protected())
            .finish()
    }
}

// === impl SleepContext ===

impl SleepContext {
    pub(crate) fn new() -> Self {
        Self {
            ctx: Context::default(),
            handoff: Handoff::new(),
            started: AtomicBool::new(false),
            thread: Mutex::new_with_raw_mutex(None, Spinlock::new()),
        }
    }

    pub(crate) fn reset(&self) {
        self.handoff.reset();
        *self.thread.lock() = None;
        self.started.store(false, Release);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Acquire)
    }

    pub(crate) fn take_thread(&self) -> Option<Handle> {
        self.thread.lock().take()
    }
}

impl fmt::Debug for SleepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepContext")
            .field("started", &self.is_started())
            .field("handoff", &self.handoff)
            .finish()
    }
}

// === impl Runtime ===

impl Runtime {
    /// Marks `from`'s stack as in use until the context behind `into`
    /// resumes.
    pub(crate) fn protect(&self, from: TaskId, into: &Handoff) {
        self.tasks.get(from).stack.protected.store(true, SeqCst);
        fence();
        if let Err(pending) = into.release.try_fill(from, SeqCst) {
            fatal!(
                &self.tasks,
                "cannot protect the stack of {from}: {pending} has not been released yet"
            );
        }
        tracing::trace!(task.id = %from, "protected stack");
    }

    /// Releases the stack recorded in `handoff`, if any.
    ///
    /// Every context calls this first thing after it resumes.
    pub(crate) fn unprotect(&self, handoff: &Handoff) {
        fence();
        if let Some(released) = handoff.release.take(SeqCst) {
            self.tasks.get(released).stack.protected.store(false, SeqCst);
            tracing::trace!(task.id = %released, "released stack");
        }
    }

    /// Waits until `id`'s stack is no longer protected.
    pub(crate) fn try_stack_wait(&self, id: TaskId) -> Result<(), StackWaitTimeout> {
        let guard = &self.tasks.get(id).stack;
        let released = || !guard.is_protected();

        fence();
        if released() {
            return Ok(());
        }

        tracing::trace!(task.id = %id, "waiting for stack release");
        if spin(self.yield_iters, released) {
            return Ok(());
        }

        let rounds = self.config.stack_wait_rounds;
        for round in 0..rounds {
            std::thread::yield_now();
            if spin(self.yield_iters.saturating_mul(10), released) {
                tracing::trace!(task.id = %id, round, "stack released");
                return Ok(());
            }
        }

        Err(StackWaitTimeout { task: id, rounds })
    }

    pub(crate) fn stack_wait(&self, id: TaskId) {
        if let Err(StackWaitTimeout { task, rounds }) = self.try_stack_wait(id) {
            fatal!(
                &self.tasks,
                "deadlock: stack of {task} still protected after {rounds} rounds"
            );
        }
    }

    /// Leaves a note for the context behind `on` to wake `wake` once it has
    /// resumed.
    pub(crate) fn set_deferred(&self, on: &Handoff, wake: TaskId) {
        if let Err(pending) = on.deferred.try_fill(wake, SeqCst) {
            fatal!(
                &self.tasks,
                "deferred wakeup of {wake} while the wakeup of {pending} is still pending"
            );
        }
    }

    pub(crate) fn deliver_deferred(&self, on: &Handoff) {
        if let Some(wake) = on.deferred.take(SeqCst) {
            tracing::trace!(task.id = %wake, "delivering deferred wakeup");
            self.wakeup(wake);
        }
    }

    /// Transfers control from the body of `from` to the body of `to`.
    ///
    /// Returns when `from` is next resumed.
    pub(crate) fn swap(&self, from: TaskId, to: TaskId) {
        let _span = tracing::debug_span!("swap", task.id = %from, to = %to).entered();
        self.stack_wait(to);
        self.switch
            .switch(&self.tasks.get(from).ctx, &self.tasks.get(to).ctx);
        self.resumed(from);
    }

    /// Transfers control from the body of `from` to the sleep context of
    /// `domain`, starting it if this is the first time.
    ///
    /// Returns when `from` is next resumed.
    pub(crate) fn decouple_switch(&self, from: TaskId, domain: TaskId) {
        let _span =
            tracing::debug_span!("decouple_switch", task.id = %from, domain = %domain).entered();
        let sleeper = &self.tasks.get(domain).sleeper;
        self.start_sleeper(domain);
        self.switch.switch(&self.tasks.get(from).ctx, &sleeper.ctx);
        self.resumed(from);
    }

    /// Transfers control from the sleep context of `domain` to the body of
    /// `to`.
    ///
    /// Returns when some task next decouples into `domain`'s sleep context.
    pub(crate) fn couple_switch(&self, domain: TaskId, to: TaskId) {
        let _span =
            tracing::debug_span!("couple_switch", domain = %domain, to = %to).entered();
        self.stack_wait(to);
        let sleeper = &self.tasks.get(domain).sleeper;
        self.switch.switch(&sleeper.ctx, &self.tasks.get(to).ctx);
    }

    /// Runs on a task's body after every switch back into it.
    fn resumed(&self, id: TaskId) {
        let task = self.tasks.get(id);
        if task.state.is_exited() {
            // woken only to return
            return;
        }
        self.unprotect(&task.handoff);
        self.deliver_deferred(&task.handoff);
        self.tasks.get(task.sched()).current.store(Some(id), Release);
    }

    fn start_sleeper(&self, domain: TaskId) {
        let sleeper = &self.tasks.get(domain).sleeper;
        if sleeper.started.swap(true, AcqRel) {
            return;
        }

        let Some(rt) = self.this.upgrade() else {
            fatal!(&self.tasks, "runtime dropped while {domain} was running");
        };
        let name = format!("hyphae-sleep-{domain}");
        match self.switch.spawn(name, move || rt.sleep_loop(domain)) {
            Ok(handle) => {
                *sleeper.thread.lock() = Some(handle);
                tracing::debug!(task.id = %domain, "started sleep context");
            }
            Err(error) => fatal!(
                &self.tasks,
                "failed to start the sleep context of {domain}: {error}"
            ),
        }
    }
}

/// Spins until `cond` returns `true`, for at most `iters` pause instructions.
fn spin(iters: usize, cond: impl Fn() -> bool) -> bool {
    for _ in 0..iters {
        if cond() {
            return true;
        }
        pause();
    }
    cond()
}
