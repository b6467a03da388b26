//! Internal helpers shared by the scheduler modules.

/// Logs the value of an expression at the `TRACE` level in test builds, and
/// evaluates to the expression's value.
///
/// Outside of tests this is just the expression.
#[cfg(not(test))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(test)]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::trace!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

/// Reports a fatal invariant violation and aborts the process.
///
/// The first argument is the runtime's shared state, which is dumped along
/// with the message.
macro_rules! fatal {
    ($shared:expr, $($arg:tt)+) => {
        $crate::diag::fatal($shared, format_args!($($arg)+))
    };
}

pub(crate) use maitake_sync::util::{Backoff, CachePadded};

/// An explicit full memory fence.
///
/// Used around every hand-off of ownership that is not ordered by a lock: the
/// stack-protection flag and the wakeup flag.
#[inline(always)]
pub(crate) fn fence() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// A single CPU pause instruction.
#[inline(always)]
pub(crate) fn pause() {
    std::hint::spin_loop();
}
