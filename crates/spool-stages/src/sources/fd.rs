use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Outq, StageError, SyncArgs};
use spool_net::{FdGuard, is_cancelled};
use tracing::{debug, info};

use crate::{Sizes, fdio::read_full};

pub struct FdReadArgs {
    pub fd: Arc<FdGuard>,
    pub sizes: Sizes,
    pub counter: Arc<AtomicU64>,
}

/// Plain blocking reader: blocksize bytes per block until EOF. The short
/// block at EOF is forwarded as-is.
pub fn fd_reader(out: &Outq<Block>, sync: &SyncArgs<FdReadArgs>) -> Result<(), StageError> {
    let (fd, sizes, counter) =
        sync.with(|a| (Arc::clone(&a.fd), a.sizes, Arc::clone(&a.counter)));
    let pool = Blockpool::new(sizes.blocksize, 16);

    info!(fd = fd.fd(), blocksize = sizes.blocksize, "fd reader starting");
    loop {
        if sync.cancelled() || fd.is_closed() {
            break;
        }
        let mut b = pool.get();
        let got = match read_full(fd.fd(), b.as_mut_slice()) {
            Ok(n) => n,
            Err(e) if is_cancelled(&e) => break,
            Err(e) => return Err(StageError::msg(format!("read: {e}"))),
        };
        if got == 0 {
            break; // EOF
        }
        let blk = if got == sizes.blocksize { b } else { b.sub(0, got) };
        if !out.push(blk) {
            break;
        }
        counter.fetch_add(got as u64, Ordering::Relaxed);
        if got < sizes.blocksize {
            break; // EOF mid-block
        }
    }
    debug!(bytes = counter.load(Ordering::Relaxed), "fd reader stopping");
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use spool_chain::Chain;
    use spool_net::open_file;

    use super::*;

    #[test]
    fn reads_file_to_eof_with_short_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        let data: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let opened = open_file(&format!("{},r", path.display())).unwrap();
        assert_eq!(opened.size, 700);

        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let args = FdReadArgs {
            fd: opened.guard,
            sizes: Sizes::plain(256),
            counter: Arc::new(AtomicU64::new(0)),
        };
        let chain = Chain::builder()
            .source("file", 4, args, fd_reader)
            .sink("collect", (), move |inq, _| {
                while let Some(b) = inq.pop() {
                    sink.lock().unwrap().extend_from_slice(b.as_slice());
                }
                Ok(())
            });
        chain.run().unwrap();
        chain.wait().unwrap();
        assert_eq!(*collected.lock().unwrap(), data);
    }

    #[test]
    fn cancel_thunk_unblocks_pipe_read() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let guard = Arc::new(FdGuard::new(fds[0]));

        let args = FdReadArgs {
            fd: Arc::clone(&guard),
            sizes: Sizes::plain(64),
            counter: Arc::new(AtomicU64::new(0)),
        };
        let chain = Chain::builder()
            .source("pipe", 2, args, fd_reader)
            .sink("swallow", (), |inq, _| {
                while inq.pop().is_some() {}
                Ok(())
            });
        let g = Arc::clone(&guard);
        chain.register_cancel(0, move || g.close()).unwrap();
        chain.run().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        // nothing ever written into the pipe: reader sits in read(2)
        chain.stop().unwrap();
        unsafe { libc::close(fds[1]) };
    }
}
