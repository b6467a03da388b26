#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
mod util;

pub mod config;
pub mod context;
mod diag;
pub mod error;
pub mod queue;
pub mod sched;
pub mod sleep;
pub mod spawn;
pub mod sync;
pub mod task;

#[doc(inline)]
pub use self::config::Config;
#[doc(inline)]
pub use self::error::Error;
#[doc(inline)]
pub use self::queue::TaskQueue;
#[doc(inline)]
pub use self::sched::{Cx, Yield, YieldMode};
#[doc(inline)]
pub use self::sleep::SyncPolicy;
#[doc(inline)]
pub use self::spawn::Builder;
#[doc(inline)]
pub use self::sync::{Barrier, Mutex};
#[doc(inline)]
pub use self::task::{TaskId, TaskInfo};

/// Initializes a new runtime, returning the context of the root task.
///
/// The calling OS thread becomes the root task (id 0), which is its own
/// scheduling domain. Every other task is created through the returned
/// [`Cx`].
///
/// # Errors
///
/// - [`Error::InvalidArgument`] if the configuration cannot hold at least the
///   root task and one more task.
pub fn init(config: Config) -> Result<Cx, Error> {
    sched::Runtime::start(config)
}

#[cfg(test)]
pub(crate) mod test_util {
    /// Installs a `fmt` subscriber for the duration of a test.
    ///
    /// The returned guard must be held until the end of the test.
    pub(crate) fn trace_init() -> impl Drop {
        use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();
        tracing_subscriber::fmt()
            .with_test_writer()
            .without_time()
            .with_env_filter(filter)
            .with_thread_names(true)
            .set_default()
    }
}
