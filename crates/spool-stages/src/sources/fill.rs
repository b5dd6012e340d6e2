use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Outq, StageError, SyncArgs};
use spool_format::{FILL_PATTERN, HeaderSearch};
use spool_timing::{Duration, Pacer};
use tracing::{debug, info};

use crate::Sizes;

pub struct FillArgs {
    /// generator idles until this goes true (or cancel)
    pub run: bool,
    /// current fill word, advanced by `inc` per block (anonymous mode) or
    /// per frame (framed mode)
    pub fill: u64,
    pub inc: u64,
    /// how many 64-bit words to produce; `u64::MAX` means "until stopped"
    pub nword: u64,
    /// pace output at the nominal ntrack x trackbitrate data rate instead
    /// of as fast as downstream accepts
    pub realtime: bool,
    /// Some = produce syncword-stamped frames of this format
    pub header: Option<HeaderSearch>,
    pub sizes: Sizes,
    pub counter: Arc<AtomicU64>,
}

impl FillArgs {
    pub fn new(sizes: Sizes, counter: Arc<AtomicU64>) -> Self {
        FillArgs {
            run: false,
            fill: FILL_PATTERN,
            inc: 0,
            nword: u64::MAX,
            realtime: false,
            header: None,
            sizes,
            counter,
        }
    }
}

/// Fill-pattern producer, anonymous or framed depending on whether a
/// format is set. Suspends until `run` is communicated.
pub fn fill_generator(out: &Outq<Block>, sync: &SyncArgs<FillArgs>) -> Result<(), StageError> {
    if !sync.wait(|a| a.run) {
        debug!("cancelled before starting");
        return Ok(());
    }
    let (sizes, nword, realtime, header, counter) =
        sync.with(|a| (a.sizes, a.nword, a.realtime, a.header, Arc::clone(&a.counter)));

    match header {
        None => anonymous(out, sync, sizes, nword, realtime, &counter),
        Some(h) => framed(out, sync, sizes, nword, realtime, h, &counter),
    }
    Ok(())
}

fn block_pace(sizes: &Sizes, byterate: u64) -> Duration {
    Duration::from_secs_f64(sizes.blocksize as f64 / byterate.max(1) as f64)
}

fn anonymous(
    out: &Outq<Block>,
    sync: &SyncArgs<FillArgs>,
    sizes: Sizes,
    nword: u64,
    realtime: bool,
    counter: &AtomicU64,
) {
    let pool = Blockpool::new(sizes.blocksize, 32);
    let words_per_block = (sizes.blocksize / 8) as u64;
    let mut pacer = Pacer::new();
    // the realtime rate only makes sense with a format; without one, pace
    // at 1 Gbps worth of blocks as a stand-in
    let ipd = block_pace(&sizes, 1_000_000_000 / 8);

    let mut left = nword;
    info!(nword, blocksize = sizes.blocksize, "generating fill pattern");
    while left > 0 && !sync.cancelled() {
        let take = left.min(words_per_block);
        let mut b = pool.get();
        let fill = sync.with(|a| {
            let f = a.fill;
            a.fill = a.fill.wrapping_add(a.inc);
            f
        });
        for chunk in b.as_mut_slice()[..take as usize * 8].chunks_mut(8) {
            chunk.copy_from_slice(&fill.to_le_bytes());
        }
        if realtime {
            pacer.pace(ipd);
        }
        let blk = if take == words_per_block { b } else { b.sub(0, take as usize * 8) };
        if !out.push(blk) {
            break;
        }
        counter.fetch_add(take * 8, Ordering::Relaxed);
        left -= take;
    }
    debug!(leftover = left, "fill generator done");
}

fn framed(
    out: &Outq<Block>,
    sync: &SyncArgs<FillArgs>,
    sizes: Sizes,
    nword: u64,
    realtime: bool,
    header: HeaderSearch,
    counter: &AtomicU64,
) {
    let pool = Blockpool::new(sizes.blocksize, 16);
    let mut pacer = Pacer::new();
    let ipd = block_pace(&sizes, header.byterate());

    // One scratch frame, regenerated whenever it has been fully copied
    // out; blocks are filled by splicing consecutive frame images.
    let mut frame = vec![0u8; header.framesize];
    let mut frameptr = header.framesize; // forces generation on first use
    let mut framecount: u64 = 0;
    let mut left_bytes = nword.saturating_mul(8);

    info!(
        nword,
        framesize = header.framesize,
        format = %header.format,
        "generating fill-pattern frames"
    );
    while left_bytes > 0 && !sync.cancelled() {
        let take = (left_bytes as usize).min(sizes.blocksize);
        let mut b = pool.get();
        let mut bpos = 0usize;
        while bpos < take {
            if frameptr == header.framesize {
                let fill = sync.with(|a| {
                    let f = a.fill;
                    a.fill = a.fill.wrapping_add(a.inc);
                    f
                });
                for chunk in frame.chunks_mut(8) {
                    chunk.copy_from_slice(&fill.to_le_bytes()[..chunk.len()]);
                }
                header.stamp_header(&mut frame, framecount);
                framecount += 1;
                frameptr = 0;
            }
            let n = (take - bpos).min(header.framesize - frameptr);
            b.as_mut_slice()[bpos..bpos + n].copy_from_slice(&frame[frameptr..frameptr + n]);
            bpos += n;
            frameptr += n;
        }
        if realtime {
            pacer.pace(ipd);
        }
        let blk = if take == sizes.blocksize { b } else { b.sub(0, take) };
        if !out.push(blk) {
            break;
        }
        counter.fetch_add(take as u64, Ordering::Relaxed);
        left_bytes -= take as u64;
    }
    debug!(frames = framecount, "framed fill generator done");
}
