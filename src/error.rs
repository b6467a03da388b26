//! Errors returned by scheduler and synchronization operations.
//!
//! These are the *usage* errors: misuse that the caller can recover from
//! locally. Contention between tasks is retried internally and never surfaces
//! here, and protocol corruption aborts the process instead (see
//! [`Cx`](crate::Cx) for which operations return which errors).

/// A recoverable error returned by a scheduler or synchronization operation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The operation is not permitted in the task's current state: resuming a
    /// task that is already running, suspending a task that is already
    /// suspended, or yielding to a task in another scheduling domain.
    #[error("operation not permitted in the task's current state")]
    PermissionDenied,

    /// The target is busy: the scheduling domain is exiting, a task is already
    /// coupled, or a wait queue still has waiters.
    #[error("resource busy")]
    Busy,

    /// An argument was invalid.
    #[error("invalid argument")]
    InvalidArgument,

    /// There was nothing to act on, e.g. dequeuing from an empty queue.
    #[error("no such entry")]
    NoEntry,

    /// There is no other task left to wait for.
    #[error("no task to wait for")]
    NoChild,

    /// Every task slot in the runtime is in use.
    #[error("no free task slots")]
    Overflow,

    /// The operating system refused to create an execution context.
    #[error("failed to spawn an OS thread")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    /// Returns the name of the classic `errno` value corresponding to this
    /// error.
    #[must_use]
    pub fn errno_name(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "EPERM",
            Self::Busy => "EBUSY",
            Self::InvalidArgument => "EINVAL",
            Self::NoEntry => "ENOENT",
            Self::NoChild => "ECHILD",
            Self::Overflow => "EOVERFLOW",
            Self::Spawn(_) => "EAGAIN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_names() {
        assert_eq!(Error::PermissionDenied.errno_name(), "EPERM");
        assert_eq!(Error::Busy.errno_name(), "EBUSY");
        assert_eq!(Error::InvalidArgument.errno_name(), "EINVAL");
        assert_eq!(Error::NoEntry.errno_name(), "ENOENT");
        assert_eq!(Error::NoChild.errno_name(), "ECHILD");
    }

    #[test]
    fn spawn_error_has_source() {
        use std::error::Error as _;
        let err = Error::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "nope"));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "failed to spawn an OS thread");
    }
}
