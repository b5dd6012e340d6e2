use std::collections::VecDeque;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::Block;
use spool_chain::{Inq, Outq, StageError, SyncArgs};
use tracing::{debug, info};

pub struct BuffererArgs {
    /// target backlog in bytes; adjustable while running through the side
    /// channel (add/dec/get bufsize)
    pub bytes_to_buffer: u64,
    pub counter: Arc<AtomicU64>,
}

/// Elasticity buffer: holds on to up to `bytes_to_buffer` of blocks,
/// releasing the oldest once over budget. Put between a bursty producer
/// and a rate-sensitive consumer it turns bursts into a steady trickle
/// (and is the backing store of the in2mem family).
pub fn bufferer(
    inq: &Inq<Block>,
    out: &Outq<Block>,
    sync: &SyncArgs<BuffererArgs>,
) -> Result<(), StageError> {
    let counter = sync.with(|a| Arc::clone(&a.counter));
    let mut backlog: VecDeque<Block> = VecDeque::new();
    let mut buffered: u64 = 0;

    info!(bytes = sync.with(|a| a.bytes_to_buffer), "bufferer starting");
    while let Some(b) = inq.pop() {
        let budget = sync.with(|a| a.bytes_to_buffer);
        while buffered > budget {
            let Some(oldest) = backlog.pop_front() else {
                break;
            };
            buffered -= oldest.len() as u64;
            if !out.push(oldest) {
                return Ok(());
            }
        }
        buffered += b.len() as u64;
        counter.fetch_add(b.len() as u64, Ordering::Relaxed);
        backlog.push_back(b);
    }
    // upstream done: drain what is left
    for b in backlog {
        if !out.push(b) {
            break;
        }
    }
    debug!("bufferer stopping");
    Ok(())
}
