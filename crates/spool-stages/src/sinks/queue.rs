use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::Block;
use spool_chain::{Inq, Queue, StageError, SyncArgs, TryPush};
use tracing::{debug, warn};

/// Sink side of a chain boundary: deposits blocks into the shared
/// interchain queue for another chain's queue reader to pick up.
pub struct QueueWriteArgs {
    pub interchain: Queue<Block>,
    pub counter: Arc<AtomicU64>,
}

/// Blocks go into the boundary queue with a cancel-aware retry instead of
/// a blocking push: nobody may be popping that queue yet (in2mem runs long
/// before mem2net shows up), and teardown must not hang on it. Once the
/// input drains, the queue is marked producer-done so a later reader can
/// drain the backlog and exit.
pub fn queue_writer(inq: &Inq<Block>, sync: &SyncArgs<QueueWriteArgs>) -> Result<(), StageError> {
    let (interchain, counter) = sync.with(|a| (a.interchain.clone(), Arc::clone(&a.counter)));
    let mut dropped: u64 = 0;
    'outer: while let Some(b) = inq.pop() {
        let len = b.len() as u64;
        let mut item = b;
        loop {
            match interchain.try_push(item) {
                Ok(()) => {
                    counter.fetch_add(len, Ordering::Relaxed);
                    break;
                }
                Err(TryPush::Disabled(_)) => break 'outer,
                Err(TryPush::Full(back)) => {
                    if sync.cancelled() {
                        dropped += 1;
                        break;
                    }
                    item = back;
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
        }
    }
    if dropped > 0 {
        warn!(dropped, "boundary queue full at teardown, blocks lost");
    }
    // this producer is done; the boundary queue keeps its backlog poppable
    // for whichever reader turns up
    interchain.delayed_disable();
    debug!("queue writer stopping");
    Ok(())
}
