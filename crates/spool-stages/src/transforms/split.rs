use std::collections::HashMap;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Inq, Outq, StageError, SyncArgs};
use spool_format::HeaderSearch;
use tracing::{debug, info, warn};

use crate::{Frame, Tagged};

/// A de-channelising function: scatter one frame's payload over `nchunk`
/// equally sized output lanes.
pub type SplitFn = fn(&[u8], &mut [&mut [u8]]);

/// Splitters by the names the splitting transfers use on the command line.
pub fn lookup_splitter(name: &str) -> Option<(SplitFn, usize)> {
    match name {
        "2Ch2bit1to2" | "extract_2Ch2bit1to2" => Some((split_2bit::<2>, 2)),
        "4Ch2bit1to2" | "extract_4Ch2bit1to2" => Some((split_2bit::<4>, 4)),
        "8Ch2bit1to2" | "extract_8Ch2bit1to2" => Some((split_2bit::<8>, 8)),
        "16Ch2bit1to2" | "extract_16Ch2bit1to2" => Some((split_2bit::<16>, 16)),
        "split8bitby4" => Some((split_8bit_by_4, 4)),
        "split16bitby2" => Some((split_16bit_by_2, 2)),
        _ => None,
    }
}

/// 2-bit samples round-robin over N channels: sample k of the input
/// belongs to channel k mod N. Collect every channel's samples densely.
fn split_2bit<const N: usize>(input: &[u8], out: &mut [&mut [u8]]) {
    let mut written = [0usize; N]; // bit positions per lane
    for (byte_idx, &byte) in input.iter().enumerate() {
        for s in 0..4 {
            let sample = (byte >> (2 * s)) & 0b11;
            let lane = (byte_idx * 4 + s) % N;
            let pos = written[lane];
            out[lane][pos / 8] |= sample << (pos % 8);
            written[lane] = pos + 2;
        }
    }
}

/// Bytes carry four 2-bit samples of four different channels.
fn split_8bit_by_4(input: &[u8], out: &mut [&mut [u8]]) {
    for (i, &byte) in input.iter().enumerate() {
        for lane in 0..4 {
            let sample = (byte >> (2 * lane)) & 0b11;
            let pos = i * 2;
            out[lane][pos / 8] |= sample << (pos % 8);
        }
    }
}

/// 16-bit little-endian words split into a low-byte and a high-byte lane.
fn split_16bit_by_2(input: &[u8], out: &mut [&mut [u8]]) {
    for (i, pair) in input.chunks_exact(2).enumerate() {
        out[0][i] = pair[0];
        out[1][i] = pair[1];
    }
}

pub struct SplitArgs {
    pub header: HeaderSearch,
    pub split: SplitFn,
    pub nchunk: usize,
    /// output tag = input tag * multiplier + lane
    pub multiplier: u32,
    pub counter: Arc<AtomicU64>,
}

/// Assign a fixed tag to an untagged frame stream so it can feed the
/// coalescing splitter.
pub fn tagger(
    inq: &Inq<Frame>,
    out: &Outq<Tagged<Frame>>,
    sync: &SyncArgs<u32>,
) -> Result<(), StageError> {
    let tag = sync.with(|t| *t);
    while let Some(f) = inq.pop() {
        if !out.push(Tagged::new(tag, f)) {
            break;
        }
    }
    Ok(())
}

struct TagState {
    block: Block,
    fcount: usize,
    time: spool_format::FrameTime,
}

/// Coalesce `nchunk` consecutive frames of each tag and split them into
/// `nchunk` de-channelised output frames: input tag X yields output tags
/// X*multiplier .. X*multiplier+nchunk-1. The output header geometry is
/// the input's with ntrack divided by nchunk.
pub fn coalescing_splitter(
    inq: &Inq<Tagged<Frame>>,
    out: &Outq<Tagged<Frame>>,
    sync: &SyncArgs<SplitArgs>,
) -> Result<(), StageError> {
    let (header, split, nchunk, multiplier, counter) = sync.with(|a| {
        (a.header, a.split, a.nchunk, a.multiplier, Arc::clone(&a.counter))
    });
    let ch_len = header.framesize / nchunk;
    let out_ntrack = header.ntrack / nchunk as u32;
    let pool = Blockpool::new(nchunk * header.framesize, nchunk.max(2));
    let mut states: HashMap<u32, TagState> = HashMap::new();

    info!(
        nchunk,
        ch_len,
        framesize = header.framesize,
        "coalescing splitter starting"
    );
    while let Some(tf) = inq.pop() {
        if tf.item.format != header.format || tf.item.data.len() != header.framesize {
            warn!(
                got = tf.item.data.len(),
                want = header.framesize,
                "unexpected frame, stopping split"
            );
            break;
        }

        let state = states.entry(tf.tag).or_insert_with(|| TagState {
            block: pool.get(),
            fcount: 0,
            time: tf.item.time,
        });

        // lane l occupies [l*framesize, (l+1)*framesize) of the big block;
        // within a lane, integration i fills [i*ch_len, (i+1)*ch_len)
        {
            let offset = state.fcount * ch_len;
            let buf = state.block.as_mut_slice();
            let mut lanes: Vec<&mut [u8]> = buf
                .chunks_mut(header.framesize)
                .map(|lane| &mut lane[offset..offset + ch_len])
                .collect();
            split(tf.item.data.as_slice(), &mut lanes);
        }
        state.fcount += 1;
        counter.fetch_add(header.framesize as u64, Ordering::Relaxed);

        if state.fcount < nchunk {
            continue;
        }

        // a full integration: ship all lanes, re-keyed
        let state = states.remove(&tf.tag).unwrap();
        for lane in 0..nchunk {
            let data = state.block.sub(lane * header.framesize, header.framesize);
            let frame = Frame {
                format: header.format,
                ntrack: out_ntrack,
                time: state.time,
                data,
            };
            if !out.push(Tagged::new(tf.tag * multiplier + lane as u32, frame)) {
                debug!("downstream gone, splitter stopping");
                return Ok(());
            }
        }
    }
    debug!("coalescing splitter stopping");
    Ok(())
}
