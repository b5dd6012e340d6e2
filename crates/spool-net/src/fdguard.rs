use std::{
    os::fd::RawFd,
    sync::atomic::{AtomicI32, Ordering},
};

use tracing::debug;

/// Shared ownership of one raw descriptor with close-exactly-once
/// semantics. The stage thread does its blocking syscalls on
/// [`fd`](Self::fd); the chain's cancel thunk calls [`close`](Self::close)
/// from another thread, which both invalidates the descriptor and makes
/// the pending syscall die with EBADF (helped along by the SIGUSR1 kick).
///
/// The descriptor value is cached across the syscall, so between close and
/// the kick there is a small window in which the number could be reused by
/// an unrelated open. Stages keep that window tiny by re-reading
/// [`fd`](Self::fd) at the top of every loop iteration.
pub struct FdGuard(AtomicI32);

impl FdGuard {
    pub fn new(fd: RawFd) -> Self {
        FdGuard(AtomicI32::new(fd))
    }

    /// Current descriptor, -1 once closed.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.fd() < 0
    }

    /// Close the descriptor; only the first caller actually closes.
    pub fn close(&self) {
        let fd = self.0.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            debug!(fd, "closing descriptor");
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Swap in a different descriptor (listener replaced by the accepted
    /// connection), closing the old one.
    pub fn replace(&self, fd: RawFd) {
        let old = self.0.swap(fd, Ordering::AcqRel);
        if old >= 0 {
            unsafe {
                libc::close(old);
            }
        }
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        self.close();
    }
}
