use std::collections::HashMap;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Inq, Outq, StageError, SyncArgs};
use spool_format::{VDIF_HEADER_SIZE, VdifHeader, vdif_epoch};
use tracing::{debug, info};

use crate::{Frame, Tagged};

pub struct ReframeArgs {
    pub station_id: u16,
    /// aggregate bits per second of one input stream, for the in-second
    /// frame numbering
    pub bitrate: u64,
    /// size of the incoming frames
    pub input_size: usize,
    /// what one outgoing unit may occupy (header included), typically the
    /// datagram budget
    pub output_size: usize,
    pub bits_per_sample: u8,
    pub counter: Arc<AtomicU64>,
}

/// Cut native-format frames into VDIF legacy frames: the largest
/// dataframe length that is a multiple of 8, divides the input evenly and
/// fits the output budget wins. Thread id is the tag, the epoch comes from
/// the first frame's wall-clock.
pub fn reframe_to_vdif(
    inq: &Inq<Tagged<Frame>>,
    out: &Outq<Tagged<Block>>,
    sync: &SyncArgs<ReframeArgs>,
) -> Result<(), StageError> {
    let (station_id, bitrate, input_size, output_size, bits_per_sample, counter) = sync.with(|a| {
        (a.station_id, a.bitrate, a.input_size, a.output_size, a.bits_per_sample, Arc::clone(&a.counter))
    });

    let Some(dataframe_length) = dataframe_length(input_size, output_size) else {
        return Err(StageError::msg(format!(
            "no usable VDIF dataframe length for input {input_size} within output {output_size}"
        )));
    };
    let chunk_ns = (dataframe_length as u64 * 8)
        .saturating_mul(1_000_000_000)
        .checked_div(bitrate)
        .unwrap_or(0)
        .max(1);
    let pool = Blockpool::new(VDIF_HEADER_SIZE + dataframe_length, 16);

    info!(
        dataframe_length,
        input_size, output_size, chunk_ns, "reframing to VDIF"
    );

    let Some(first) = inq.pop() else {
        debug!("cancelled before the first frame");
        return Ok(());
    };
    let (epoch, epoch_start) = vdif_epoch(first.item.time.sec);

    let mut headers: HashMap<u32, VdifHeader> = HashMap::new();
    let mut done: u64 = 0;
    let mut tf = first;
    loop {
        if tf.item.data.len() != input_size {
            debug!(got = tf.item.data.len(), want = input_size, "skipping odd-sized frame");
        } else {
            let hdr = headers.entry(tf.tag).or_insert_with(|| VdifHeader {
                invalid: false,
                epoch_seconds: 0,
                ref_epoch: epoch,
                data_frame_num: 0,
                log2nchans: 0,
                data_frame_len8: (dataframe_length / 8) as u32,
                bits_per_sample: bits_per_sample.saturating_sub(1),
                thread_id: (tf.tag & 0x3ff) as u16,
                station_id,
            });
            // dataframes never span a second boundary, so the seconds field
            // holds for every chunk of this frame
            hdr.epoch_seconds = ((tf.item.time.sec - epoch_start) as u32) & 0x3fff_ffff;

            let data = tf.item.data.as_slice();
            let mut dfn = tf.item.time.ns as u64 / chunk_ns;
            let mut pos = 0usize;
            while pos < input_size {
                hdr.data_frame_num = (dfn & 0x00ff_ffff) as u32;
                let mut b = pool.get();
                {
                    let buf = b.as_mut_slice();
                    buf[..VDIF_HEADER_SIZE].copy_from_slice(&hdr.to_bytes());
                    buf[VDIF_HEADER_SIZE..].copy_from_slice(&data[pos..pos + dataframe_length]);
                }
                if !out.push(Tagged::new(tf.tag, b)) {
                    debug!(done, "downstream gone, reframer stopping");
                    return Ok(());
                }
                counter.fetch_add((VDIF_HEADER_SIZE + dataframe_length) as u64, Ordering::Relaxed);
                dfn += 1;
                pos += dataframe_length;
            }
            done += 1;
        }
        match inq.pop() {
            Some(next) => tf = next,
            None => break,
        }
    }
    debug!(frames = done, "reframer stopping");
    Ok(())
}

/// Largest multiple of 8 that divides `input_size` evenly and leaves room
/// for the header within `output_size`.
fn dataframe_length(input_size: usize, output_size: usize) -> Option<usize> {
    (1..input_size)
        .map(|i| input_size / i)
        .find(|&dfl| dfl % 8 == 0 && input_size % dfl == 0 && dfl + VDIF_HEADER_SIZE <= output_size)
}

#[cfg(test)]
mod test {
    use spool_chain::Chain;
    use spool_format::{FrameTime, TrackFormat};

    use super::*;

    #[test]
    fn picks_largest_fitting_dataframe_length() {
        // 8000-byte frames into 9000-byte datagrams: whole frame fits
        assert_eq!(dataframe_length(8000, 9000), Some(8000));
        // into 4096-byte datagrams: halves do
        assert_eq!(dataframe_length(8000, 4116), Some(4000));
        // nothing fits inside a 16-byte budget
        assert_eq!(dataframe_length(8000, 16), None);
    }

    #[test]
    fn emits_valid_headers_with_sequential_frame_numbers() {
        let input_size = 8000usize;
        let time = FrameTime { sec: 1_592_224_496, ns: 0 }; // 2020-06-15
        let pool = Blockpool::new(input_size, 8);

        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let args = ReframeArgs {
            station_id: 0x4a56,
            bitrate: 64_000_000,
            input_size,
            output_size: 2048,
            bits_per_sample: 2,
            counter: Arc::new(AtomicU64::new(0)),
        };
        let chain = Chain::builder()
            .source("feed", 4, pool, move |out, sync| {
                sync.with(|pool| {
                    for _ in 0..2 {
                        let mut b = pool.get();
                        b.as_mut_slice().fill(0x2c);
                        let frame = Frame {
                            format: TrackFormat::Vdif,
                            ntrack: 1,
                            time,
                            data: b.sub(0, b.len()),
                        };
                        if !out.push(Tagged::new(3, frame)) {
                            break;
                        }
                    }
                });
                Ok(())
            })
            .step("reframe", 8, args, reframe_to_vdif)
            .sink("collect", (), move |inq, _| {
                while let Some(t) = inq.pop() {
                    sink.lock().unwrap().push(t);
                }
                Ok(())
            });
        chain.run().unwrap();
        chain.wait().unwrap();

        let got = collected.lock().unwrap();
        // 8000 / 2000 = 4 chunks per input frame, 2 input frames
        assert_eq!(got.len(), 8);
        let dfl = dataframe_length(input_size, 2048).unwrap();
        for (i, t) in got.iter().enumerate() {
            assert_eq!(t.tag, 3);
            assert_eq!(t.item.len(), VDIF_HEADER_SIZE + dfl);
            let hdr = VdifHeader::from_bytes(t.item.as_slice());
            assert!(!hdr.invalid);
            assert_eq!(hdr.thread_id, 3);
            assert_eq!(hdr.station_id, 0x4a56);
            assert_eq!(hdr.ref_epoch, 40);
            assert_eq!(hdr.data_frame_num as usize, i % 4);
            assert_eq!(hdr.data_frame_len8 as usize, dfl / 8);
            // payload intact
            assert!(t.item.as_slice()[VDIF_HEADER_SIZE..].iter().all(|&b| b == 0x2c));
        }
    }
}
