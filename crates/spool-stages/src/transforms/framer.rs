use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Inq, Outq, StageError, SyncArgs};
use spool_format::HeaderSearch;
use tracing::{debug, info};

use crate::Frame;

pub struct FramerArgs {
    pub header: HeaderSearch,
    /// also CRC-check a header-bearing track before emitting (settable at
    /// runtime through the side channel)
    pub strict: bool,
    /// anchors the ambiguous header dates
    pub ref_sec: i64,
    pub counter: Arc<AtomicU64>,
}

/// Locate frame boundaries in an arbitrary-sized block stream and emit one
/// [`Frame`] per frame found.
///
/// Frames that lie entirely inside one incoming block are emitted as
/// zero-copy sub-blocks; only frames straddling block boundaries go
/// through the accumulator.
pub fn framer(
    inq: &Inq<Block>,
    out: &Outq<Frame>,
    sync: &SyncArgs<FramerArgs>,
) -> Result<(), StageError> {
    let (header, ref_sec, counter) =
        sync.with(|a| (a.header, a.ref_sec, Arc::clone(&a.counter)));
    let syncword = header.syncword;
    let sync_area = header.syncword_area();
    let framesize = header.framesize;

    if framesize < header.headersize {
        return Err(StageError::msg("framesize smaller than headersize"));
    }

    let pool = Blockpool::new(framesize, 8);
    let mut nframe: u64 = 0;
    let mut nbytes: u64 = 0;

    // bytes carried over from previous blocks, always < framesize
    let mut accu = pool.get();
    let mut cached = 0usize;

    info!(
        format = %header.format,
        framesize,
        sync_offset = header.syncword_offset,
        "framer looking for frames"
    );

    let emit = |out: &Outq<Frame>, data: Block, nframe: &mut u64| -> bool {
        let time = header.timestamp(data.as_slice(), ref_sec);
        let ok = out.push(Frame { format: header.format, ntrack: header.ntrack, time, data });
        if ok {
            *nframe += 1;
            counter.fetch_add(framesize as u64, Ordering::Relaxed);
        }
        ok
    };

    'blocks: while let Some(b) = inq.pop() {
        nbytes += b.len() as u64;
        let bytes = b.as_slice();
        let mut pos = 0usize;

        // stitch a straddling frame together with bytes cached from the
        // previous blocks
        while cached > 0 && pos < bytes.len() {
            if cached < sync_area {
                // not yet sure the cache starts at a frame: top it up to
                // just under two sync areas and look for the syncword
                let want = (2 * sync_area - 1 - cached).min(bytes.len() - pos);
                accu.as_mut_slice()[cached..cached + want]
                    .copy_from_slice(&bytes[pos..pos + want]);
                cached += want;
                pos += want;

                match find(syncword, &accu.as_slice()[..cached]) {
                    None => {
                        if cached >= sync_area {
                            // no syncword in here; keep only the tail that
                            // could still be the start of one
                            let keep = sync_area - 1;
                            accu.as_mut_slice().copy_within(cached - keep..cached, 0);
                            cached = keep;
                            continue;
                        }
                        // genuinely too few bytes, next block please
                        continue 'blocks;
                    }
                    Some(at) if at < header.syncword_offset => {
                        // pre-syncword bytes are already gone, unusable
                        cached = 0;
                        pos = 0;
                        break;
                    }
                    Some(at) => {
                        let shift = at - header.syncword_offset;
                        accu.as_mut_slice().copy_within(shift..cached, 0);
                        cached -= shift;
                    }
                }
                continue;
            }
            let want = (framesize - cached).min(bytes.len() - pos);
            accu.as_mut_slice()[cached..cached + want].copy_from_slice(&bytes[pos..pos + want]);
            cached += want;
            pos += want;
            if cached == framesize {
                let full = std::mem::replace(&mut accu, pool.get());
                cached = 0;
                if !emit(out, full, &mut nframe) {
                    break 'blocks;
                }
            }
        }

        // main scan over the rest of the block
        while pos < bytes.len() {
            let Some(sw_rel) = find(syncword, &bytes[pos..]) else {
                // keep a potential partial syncword area for next time
                let keep = (sync_area - 1).min(bytes.len() - pos);
                let from = bytes.len() - keep;
                accu.as_mut_slice()[..keep].copy_from_slice(&bytes[from..]);
                cached = keep;
                break;
            };
            if sw_rel < header.syncword_offset {
                // missing pre-syncword bytes: skip past this syncword
                pos += sw_rel + syncword.len();
                continue;
            }
            let sof = pos + sw_rel - header.syncword_offset;
            if sof + framesize > bytes.len() {
                // truncated frame, accumulate for the next block
                let avail = bytes.len() - sof;
                accu.as_mut_slice()[..avail].copy_from_slice(&bytes[sof..]);
                cached = avail;
                break;
            }
            // whole frame inside this block: zero-copy
            let fblock = b.sub(sof, framesize);
            if strict_reject(sync, &fblock) {
                pos = sof + 1;
                continue;
            }
            if !emit(out, fblock, &mut nframe) {
                break 'blocks;
            }
            pos = sof + framesize;
        }
    }

    let fraction = if nbytes == 0 {
        0.0
    } else {
        (nframe * framesize as u64) as f64 / nbytes as f64 * 100.0
    };
    debug!(frames = nframe, fraction, "framer stopping");
    Ok(())
}

/// In strict mode, verify the timestamp-bearing header checks out (Mark4
/// track CRC). Expensive, so down to the operator to switch on.
fn strict_reject(sync: &SyncArgs<FramerArgs>, frame: &Block) -> bool {
    use spool_format::{TrackFormat, crc12_mark4};

    let (strict, header) = sync.with(|a| (a.strict, a.header));
    if !strict {
        return false;
    }
    match header.format {
        TrackFormat::Mark4 => {
            // rebuild track 0's header bytes and check the embedded crc
            let bytes = frame.as_slice();
            let n = header.ntrack as usize;
            let mut hdr = [0u8; 20];
            for (i, h) in hdr.iter_mut().enumerate() {
                let mut out = 0u8;
                for j in 0..8 {
                    let bitpos = (i * 8 + j) * n;
                    let bit = (bytes[bitpos / 8] >> (bitpos % 8)) & 1;
                    out |= bit << (7 - j);
                }
                *h = out;
            }
            let embedded = (((hdr[18] & 0x0f) as u16) << 8) | hdr[19] as u16;
            hdr[18] = 0;
            hdr[19] = 0;
            crc12_mark4(&hdr) != embedded
        }
        _ => false,
    }
}

/// Byte-level syncword search. The syncwords are short and the scan is a
/// fraction of the data rate, so the naive windowed compare beats setting
/// up anything fancier.
fn find(needle: &[u8], hay: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Strip frames back to plain blocks (checker and net paths that do not
/// care about frame identity).
pub fn frame_to_block(
    inq: &Inq<Frame>,
    out: &Outq<Block>,
    _sync: &SyncArgs<()>,
) -> Result<(), StageError> {
    while let Some(f) = inq.pop() {
        if !out.push(f.data) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use spool_chain::Chain;
    use spool_format::TrackFormat;

    use super::*;

    fn mk5b_header() -> HeaderSearch {
        HeaderSearch::new(TrackFormat::Mark5B, 32, 32_000_000).unwrap()
    }

    fn make_frames(header: &HeaderSearch, n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..n {
            let mut f = vec![0u8; header.framesize];
            spool_format::write_fill(&mut f, 0xdead_beef_0000_0000 + i as u64);
            header.stamp_header(&mut f, i as u64);
            out.extend_from_slice(&f);
        }
        out
    }

    fn frames_through(data: Vec<u8>, chunk: usize) -> Vec<Frame> {
        let header = mk5b_header();
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let pool = Blockpool::new(chunk, 8);

        let args = FramerArgs {
            header,
            strict: false,
            ref_sec: 1_600_000_000,
            counter: Arc::new(AtomicU64::new(0)),
        };
        let chain = Chain::builder()
            .source("feed", 4, (data, pool), move |out, sync| {
                sync.with(|&mut (ref data, ref pool)| {
                    for piece in data.chunks(chunk) {
                        let mut b = pool.get();
                        b.as_mut_slice()[..piece.len()].copy_from_slice(piece);
                        let blk = if piece.len() == chunk { b } else { b.sub(0, piece.len()) };
                        if !out.push(blk) {
                            break;
                        }
                    }
                });
                Ok(())
            })
            .step("framer", 4, args, framer)
            .sink("collect", (), move |inq, _| {
                while let Some(f) = inq.pop() {
                    sink.lock().unwrap().push(f);
                }
                Ok(())
            });
        chain.run().unwrap();
        chain.wait().unwrap();
        Arc::try_unwrap(collected).unwrap().into_inner().unwrap()
    }

    #[test]
    fn aligned_frames_come_out_whole() {
        let header = mk5b_header();
        let data = make_frames(&header, 4);
        // feed in exact framesize chunks: every frame is zero-copy
        let frames = frames_through(data, header.framesize);
        assert_eq!(frames.len(), 4);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.data.len(), header.framesize);
            assert_eq!(&f.data.as_slice()[0..4], &spool_format::MK5B_SYNCWORD);
            let num = u32::from_le_bytes(f.data.as_slice()[4..8].try_into().unwrap());
            assert_eq!(num as usize, i);
        }
    }

    #[test]
    fn frames_straddling_blocks_are_reassembled() {
        let header = mk5b_header();
        let data = make_frames(&header, 5);
        // 4000 does not divide 10016: every frame straddles
        let frames = frames_through(data, 4000);
        assert_eq!(frames.len(), 5);
        for (i, f) in frames.iter().enumerate() {
            let num = u32::from_le_bytes(f.data.as_slice()[4..8].try_into().unwrap());
            assert_eq!(num as usize, i);
        }
    }

    #[test]
    fn garbage_prefix_is_skipped() {
        let header = mk5b_header();
        let mut data = vec![0x55u8; 777];
        data.extend(make_frames(&header, 2));
        let frames = frames_through(data, 2048);
        assert_eq!(frames.len(), 2);
    }
}
