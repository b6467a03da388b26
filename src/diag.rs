//! Fatal invariant violations.
//!
//! When the scheduling protocol itself has been violated (a reference count
//! went negative, a task was linked onto two queues, a stack was never
//! released), no task can safely continue. The runtime logs everything it
//! knows and aborts the process.
use crate::task::Arena;
use std::{backtrace::Backtrace, fmt, process};

#[cold]
#[inline(never)]
pub(crate) fn fatal(tasks: &Arena, message: fmt::Arguments<'_>) -> ! {
    let backtrace = Backtrace::force_capture();
    let thread = std::thread::current();
    tracing::error!(
        thread = thread.name().unwrap_or("<unnamed>"),
        "fatal scheduler error: {message}"
    );
    for task in tasks.live() {
        tracing::error!("  {task:?}");
    }
    tracing::error!("backtrace:\n{backtrace}");

    // the subscriber may be gone, or filtering errors out
    eprintln!("hyphae: fatal scheduler error: {message}");
    eprintln!("hyphae: live tasks ({} slots): {tasks:#?}", tasks.capacity());
    eprintln!("hyphae: backtrace:\n{backtrace}");
    process::abort()
}
