use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Outq, StageError, SyncArgs};
use tracing::{debug, info};

use crate::{DiskRead, Sizes};

pub struct DiskArgs {
    pub run: bool,
    /// half-open byte range [pp_start, pp_end) into the recording
    pub pp_start: u64,
    pub pp_end: u64,
    /// loop back to pp_start at the end instead of finishing
    pub repeat: bool,
    pub dev: Arc<dyn DiskRead>,
    pub sizes: Sizes,
    pub counter: Arc<AtomicU64>,
}

/// Replay from the block device: blocksize chunks from the current play
/// pointer until the end pointer, optionally wrapping. Parks until `run`.
pub fn disk_reader(out: &Outq<Block>, sync: &SyncArgs<DiskArgs>) -> Result<(), StageError> {
    if !sync.wait(|a| a.run) {
        debug!("cancelled before starting");
        return Ok(());
    }
    let (sizes, dev, counter) =
        sync.with(|a| (a.sizes, Arc::clone(&a.dev), Arc::clone(&a.counter)));
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;

    let pool = Blockpool::new(sizes.blocksize, 16);
    let mut cur = sync.with(|a| a.pp_start);
    info!(start = cur, "disk reader starting");

    loop {
        // the end pointer may move under us via the side channel
        let (end, repeat) = sync.with(|a| (a.pp_end, a.repeat));
        if cur >= end {
            if !repeat {
                break;
            }
            cur = sync.with(|a| a.pp_start);
            continue;
        }
        if sync.cancelled() {
            break;
        }

        let want = sizes.blocksize.min((end - cur) as usize);
        let mut b = pool.get();
        dev.read_at(cur, &mut b.as_mut_slice()[..want])
            .map_err(|e| StageError::msg(format!("device read at {cur}: {e}")))?;

        let blk = if want == sizes.blocksize { b } else { b.sub(0, want) };
        if !out.push(blk) {
            break;
        }
        cur += want as u64;
        counter.fetch_add(want as u64, Ordering::Relaxed);
    }
    debug!(at = cur, "disk reader stopping");
    Ok(())
}
