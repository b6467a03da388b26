//! Synchronization primitives for tasks.
//!
//! These are built directly on the scheduler: a task that has to wait is
//! suspended onto the primitive's [`TaskQueue`](crate::TaskQueue), so its
//! scheduling domain goes on to run something else (or sleeps) rather than
//! spinning on the OS thread.
//!
//! - [`Barrier`]: a reusable rendezvous of a fixed number of tasks.
//! - [`Mutex`]: a counting entry gate admitting one task at a time.
mod barrier;
mod mutex;

pub use self::barrier::Barrier;
pub use self::mutex::Mutex;
