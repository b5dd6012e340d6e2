use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Outq, Queue, StageError, SyncArgs};
use tracing::debug;

use crate::Sizes;

/// Source at the boundary between two chains: the upstream chain deposits
/// blocks into a shared queue (the "mem" of in2mem/mem2net), this stage
/// picks them up for its own chain.
pub struct QueueReadArgs {
    pub interchain: Queue<Block>,
    pub sizes: Sizes,
    pub counter: Arc<AtomicU64>,
}

/// Re-block the incoming stream to this chain's blocksize: bytes are
/// accumulated into fresh pool blocks so downstream sees exactly the
/// geometry the constraint solver promised it.
pub fn queue_reader(out: &Outq<Block>, sync: &SyncArgs<QueueReadArgs>) -> Result<(), StageError> {
    let (interchain, sizes, counter) =
        sync.with(|a| (a.interchain.clone(), a.sizes, Arc::clone(&a.counter)));
    let pool = Blockpool::new(sizes.blocksize, 16);

    let mut acc = pool.get();
    let mut filled = 0usize;
    while let Some(b) = interchain.pop() {
        if sync.cancelled() {
            break;
        }
        let mut src = b.as_slice();
        while !src.is_empty() {
            let n = src.len().min(sizes.blocksize - filled);
            acc.as_mut_slice()[filled..filled + n].copy_from_slice(&src[..n]);
            filled += n;
            src = &src[n..];
            if filled == sizes.blocksize {
                if !out.push(std::mem::replace(&mut acc, pool.get())) {
                    debug!("queue reader: downstream gone");
                    return Ok(());
                }
                counter.fetch_add(sizes.blocksize as u64, Ordering::Relaxed);
                filled = 0;
            }
        }
    }
    if filled > 0 {
        let tail = acc.sub(0, filled);
        if out.push(tail) {
            counter.fetch_add(filled as u64, Ordering::Relaxed);
        }
    }
    debug!("queue reader stopping");
    Ok(())
}

/// The no-reblocking variant: pass blocks through untouched. Good enough
/// when both chains run the same geometry, and it saves the copy.
pub fn stupid_queue_reader(
    out: &Outq<Block>,
    sync: &SyncArgs<QueueReadArgs>,
) -> Result<(), StageError> {
    let (interchain, counter) = sync.with(|a| (a.interchain.clone(), Arc::clone(&a.counter)));
    while let Some(b) = interchain.pop() {
        if sync.cancelled() {
            break;
        }
        let len = b.len() as u64;
        if !out.push(b) {
            break;
        }
        counter.fetch_add(len, Ordering::Relaxed);
    }
    debug!("stupid queue reader stopping");
    Ok(())
}

#[cfg(test)]
mod test {
    use spool_chain::Chain;

    use super::*;

    #[test]
    fn reblocks_across_chain_boundary() {
        let interchain: Queue<Block> = Queue::new(8);
        let feed_pool = Blockpool::new(100, 4);
        // 5 x 100 bytes in, 512-byte blocks out: expect 500 bytes total
        for i in 0..5u8 {
            let mut b = feed_pool.get();
            b.as_mut_slice().fill(i + 1);
            interchain.push(b);
        }
        interchain.delayed_disable();

        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let args = QueueReadArgs {
            interchain: interchain.clone(),
            sizes: Sizes::plain(512),
            counter: Arc::new(AtomicU64::new(0)),
        };
        let chain = Chain::builder()
            .source("qread", 4, args, queue_reader)
            .sink("collect", (), move |inq, _| {
                while let Some(b) = inq.pop() {
                    sink.lock().unwrap().extend_from_slice(b.as_slice());
                }
                Ok(())
            });
        chain.run().unwrap();
        chain.wait().unwrap();

        let got = collected.lock().unwrap();
        assert_eq!(got.len(), 500);
        assert!(got[0..100].iter().all(|&x| x == 1));
        assert!(got[400..500].iter().all(|&x| x == 5));
    }

    #[test]
    fn stupid_variant_passes_blocks_through() {
        let interchain: Queue<Block> = Queue::new(4);
        let feed_pool = Blockpool::new(64, 4);
        let mut b = feed_pool.get();
        b.as_mut_slice().fill(0x7e);
        interchain.push(b);
        interchain.delayed_disable();

        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);
        let args = QueueReadArgs {
            interchain: interchain.clone(),
            sizes: Sizes::plain(512),
            counter: Arc::new(AtomicU64::new(0)),
        };
        let chain = Chain::builder()
            .source("qread", 4, args, stupid_queue_reader)
            .sink("check", (), move |inq, _| {
                while let Some(b) = inq.pop() {
                    assert_eq!(b.len(), 64);
                    seen.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            });
        chain.run().unwrap();
        chain.wait().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
