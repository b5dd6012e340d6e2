use std::sync::{Condvar, Mutex};

struct Inner<A> {
    args: A,
    cancelled: bool,
}

/// A stage's userdata plus its cancel flag, shared between the running
/// stage thread and the supervisor's side channel
/// ([`Chain::communicate`](crate::Chain::communicate)). Every mutation goes
/// through the one lock and wakes anybody sitting in [`wait`](Self::wait) -
/// that is how "fill2net=on" reaches a generator parked on its run flag.
pub struct SyncArgs<A> {
    inner: Mutex<Inner<A>>,
    cond: Condvar,
}

impl<A> SyncArgs<A> {
    pub fn new(args: A) -> Self {
        SyncArgs { inner: Mutex::new(Inner { args, cancelled: false }), cond: Condvar::new() }
    }

    /// Apply `f` to the userdata under the lock and wake waiters.
    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let r = f(&mut inner.args);
        self.cond.notify_all();
        r
    }

    /// Block until `pred(args)` holds or the stage is cancelled. Returns
    /// `false` on cancellation.
    pub fn wait(&self, mut pred: impl FnMut(&A) -> bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.cancelled {
                return false;
            }
            if pred(&inner.args) {
                return true;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    pub(crate) fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    struct Args {
        run: bool,
    }

    #[test]
    fn wait_sees_side_channel_update() {
        let sync = Arc::new(SyncArgs::new(Args { run: false }));
        let s2 = Arc::clone(&sync);
        let waiter = thread::spawn(move || s2.wait(|a| a.run));
        thread::sleep(Duration::from_millis(20));
        sync.with(|a| a.run = true);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn cancel_releases_waiter() {
        let sync = Arc::new(SyncArgs::new(Args { run: false }));
        let s2 = Arc::clone(&sync);
        let waiter = thread::spawn(move || s2.wait(|a| a.run));
        thread::sleep(Duration::from_millis(20));
        sync.cancel();
        assert!(!waiter.join().unwrap());
        assert!(sync.cancelled());
    }
}
