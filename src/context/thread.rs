//! A portable context switcher built on OS threads.
//!
//! Every context is backed by its own OS thread. Saving a context is parking
//! that thread on a binary permit; restoring one is granting its permit. A
//! switch grants the incoming context's permit and then parks on the
//! outgoing one's, so exactly one thread of each switch chain runs at a time.
use super::ContextSwitch;
use parking_lot::{Condvar, Mutex};
use std::{io, thread};

/// The [`ContextSwitch`] implementation used on every target.
#[derive(Copy, Clone, Debug, Default)]
pub struct ThreadSwitch {
    _p: (),
}

/// A binary hand-off permit: a parked resumption point.
#[derive(Debug, Default)]
pub struct Permit {
    granted: Mutex<bool>,
    cond: Condvar,
}

impl Permit {
    fn grant(&self) {
        let mut granted = self.granted.lock();
        debug_assert!(!*granted, "permit granted twice without being taken");
        *granted = true;
        self.cond.notify_one();
    }

    fn take(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cond.wait(&mut granted);
        }
        *granted = false;
    }
}

impl ContextSwitch for ThreadSwitch {
    type Context = Permit;
    type Handle = thread::JoinHandle<()>;

    fn switch(&self, from: &Permit, to: &Permit) {
        to.grant();
        from.take();
    }

    fn resume(&self, to: &Permit) {
        to.grant();
    }

    fn suspend(&self, ctx: &Permit) {
        ctx.take();
    }

    fn spawn<F>(&self, name: String, entry: F) -> io::Result<Self::Handle>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new().name(name).spawn(entry)
    }

    fn join(&self, handle: Self::Handle) -> bool {
        handle.join().is_ok()
    }
}
