use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::Block;
use spool_chain::{Inq, StageError, SyncArgs};
use spool_net::{FdGuard, accept_incoming, is_cancelled};
use tracing::{debug, info};

use crate::fdio::{read_full, write_full};

pub struct FdWriteArgs {
    pub fd: Arc<FdGuard>,
    pub counter: Arc<AtomicU64>,
}

/// Blind copy of blocks to a descriptor. A short write is fatal; EBADF
/// after the cancel thunk closed us is a normal goodbye.
pub fn fd_writer(inq: &Inq<Block>, sync: &SyncArgs<FdWriteArgs>) -> Result<(), StageError> {
    let (fd, counter) = sync.with(|a| (Arc::clone(&a.fd), Arc::clone(&a.counter)));
    info!(fd = fd.fd(), "fd writer starting");
    let mut nbyte: u64 = 0;
    while let Some(b) = inq.pop() {
        if sync.cancelled() || fd.is_closed() {
            break;
        }
        match write_full(fd.fd(), b.as_slice()) {
            Ok(()) => {}
            Err(e) if is_cancelled(&e) => break,
            Err(e) => return Err(StageError::msg(format!("write of {} bytes: {e}", b.len()))),
        }
        nbyte += b.len() as u64;
        counter.fetch_add(b.len() as u64, Ordering::Relaxed);
    }
    debug!(nbyte, "fd writer stopping");
    Ok(())
}

/// Correlator hand-off: wait for the correlator to connect to our unix
/// listener, swallow its 20-byte greeting, then stream blocks at it.
pub fn sfxc_writer(inq: &Inq<Block>, sync: &SyncArgs<FdWriteArgs>) -> Result<(), StageError> {
    let fd = sync.with(|a| Arc::clone(&a.fd));
    info!(fd = fd.fd(), "waiting for correlator rendezvous");
    match accept_incoming(fd.fd()) {
        Ok((conn, peer)) => {
            if sync.cancelled() {
                unsafe { libc::close(conn) };
                return Ok(());
            }
            info!(%peer, "correlator connected");
            fd.replace(conn);
        }
        Err(e) if is_cancelled(&e) => return Ok(()),
        Err(e) => return Err(StageError::msg(format!("accept: {e}"))),
    }

    let mut greeting = [0u8; 20];
    match read_full(fd.fd(), &mut greeting) {
        Ok(20) => {}
        Ok(n) => return Err(StageError::msg(format!("short rendezvous greeting: {n} bytes"))),
        Err(e) if is_cancelled(&e) => return Ok(()),
        Err(e) => return Err(StageError::msg(format!("rendezvous read: {e}"))),
    }

    fd_writer(inq, sync)
}
