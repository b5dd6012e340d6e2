use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::Block;
use spool_chain::{Inq, Outq, StageError, SyncArgs};
use spool_format::{Codec, FILL_PATTERN, is_fill_marked};
use tracing::{debug, info, warn};

use crate::{Frame, Sizes};

pub struct CompressArgs {
    pub codec: Codec,
    pub sizes: Sizes,
    pub counter: Arc<AtomicU64>,
}

/// Compress a block stream in place: each read_size region keeps its
/// compress_offset header bytes and has the rest squeezed down, the
/// write_size result emitted as a sub-block of the original.
pub fn block_compressor(
    inq: &Inq<Block>,
    out: &Outq<Block>,
    sync: &SyncArgs<CompressArgs>,
) -> Result<(), StageError> {
    let (codec, sizes, counter) = sync.with(|a| (a.codec, a.sizes, Arc::clone(&a.counter)));
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;
    let rd = sizes.read_size;
    let wr = sizes.write_size;
    let co = sizes.compress_offset;

    info!(read = rd, write = wr, offset = co, kept = codec.kept(), "block compressor starting");
    while let Some(mut b) = inq.pop() {
        if b.len() < sizes.blocksize {
            warn!(got = b.len(), want = sizes.blocksize, "skipping short block");
            continue;
        }
        let mut region = 0usize;
        while region + rd <= sizes.blocksize {
            let n = codec
                .compress(&mut b.as_mut_slice()[region + co..region + rd])
                .map_err(|e| StageError::msg(e.to_string()))?;
            debug_assert_eq!(co + n, wr);
            if !out.push(b.sub(region, wr)) {
                return Ok(());
            }
            counter.fetch_add(wr as u64, Ordering::Relaxed);
            region += rd;
        }
    }
    debug!("block compressor stopping");
    Ok(())
}

/// Frame-wise variant: same region scheme but driven by framesize-shaped
/// input, so header-bearing regions stay aligned with frame headers.
pub fn frame_compressor(
    inq: &Inq<Frame>,
    out: &Outq<Block>,
    sync: &SyncArgs<CompressArgs>,
) -> Result<(), StageError> {
    let (codec, sizes, counter) = sync.with(|a| (a.codec, a.sizes, Arc::clone(&a.counter)));
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;
    let rd = sizes.read_size;
    let wr = sizes.write_size;
    let co = sizes.compress_offset;
    let Some(framesize) = sizes.framesize else {
        return Err(StageError::msg("frame compressor without a framesize"));
    };

    info!(read = rd, write = wr, framesize, "frame compressor starting");
    while let Some(mut f) = inq.pop() {
        if f.data.len() != framesize {
            warn!(got = f.data.len(), want = framesize, "skipping oddly-sized frame");
            continue;
        }
        let mut region = 0usize;
        while region + rd <= framesize {
            codec
                .compress(&mut f.data.as_mut_slice()[region + co..region + rd])
                .map_err(|e| StageError::msg(e.to_string()))?;
            if !out.push(f.data.sub(region, wr)) {
                return Ok(());
            }
            counter.fetch_add(wr as u64, Ordering::Relaxed);
            region += rd;
        }
    }
    debug!("frame compressor stopping");
    Ok(())
}

/// Expand compressed write_size chunks back to read_size in place. A chunk
/// whose leading 8 bytes are the fill-pattern marker stands for a lost
/// datagram: it carries no compression state and is re-filled with pattern
/// instead of being fed to the bit mover.
pub fn block_decompressor(
    inq: &Inq<Block>,
    out: &Outq<Block>,
    sync: &SyncArgs<CompressArgs>,
) -> Result<(), StageError> {
    let (codec, sizes, counter) = sync.with(|a| (a.codec, a.sizes, Arc::clone(&a.counter)));
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;
    // the solver's sizes run backwards here: regions arrive
    // write_size-filled inside read_size slots
    let wr = sizes.read_size;
    let co = sizes.compress_offset;

    info!(compressed = sizes.write_size, expanded = wr, "block decompressor starting");
    while let Some(mut b) = inq.pop() {
        if b.len() < sizes.blocksize {
            warn!(got = b.len(), want = sizes.blocksize, "skipping short block");
            continue;
        }
        let mut region = 0usize;
        while region + wr <= sizes.blocksize {
            let buf = b.as_mut_slice();
            if is_fill_marked(&buf[region..]) {
                // lost datagram: overwrite the whole slot with pattern
                spool_format::write_fill(&mut buf[region..region + wr], FILL_PATTERN);
            } else {
                codec
                    .decompress(&mut buf[region + co..region + wr])
                    .map_err(|e| StageError::msg(e.to_string()))?;
            }
            counter.fetch_add(wr as u64, Ordering::Relaxed);
            region += wr;
        }
        if !out.push(b) {
            break;
        }
    }
    debug!("block decompressor stopping");
    Ok(())
}
