use spool_format::Codec;
use spool_stages::{Sizes, SizesError};
use thiserror::Error;

use crate::NetParms;

#[derive(Error, Debug)]
pub enum SolveError {
    #[error("mtu {mtu} leaves no room for payload (overhead {overhead})")]
    MtuTooSmall { mtu: usize, overhead: usize },
    #[error("framesize {0} has no datagram-sized divisor")]
    UnsplittableFrame(usize),
    #[error(transparent)]
    Inconsistent(#[from] SizesError),
}

/// Derive the mutually consistent chunk geometry from the network knobs,
/// the data format and the compression solution (§ the constraint set):
/// read_size divides blocksize and - when framing is in play - framesize;
/// write_size fits a datagram for datagram transports; compression shrinks
/// write_size relative to read_size.
pub fn solve_sizes(
    np: &NetParms,
    framesize: Option<usize>,
    headersize: usize,
    codec: Option<&Codec>,
) -> Result<Sizes, SolveError> {
    let sizes = if np.protocol.is_datagram() {
        let overhead = np.protocol.datagram_overhead();
        let budget = np
            .mtu
            .checked_sub(overhead)
            .filter(|&b| b >= 64)
            .ok_or(SolveError::MtuTooSmall { mtu: np.mtu, overhead })?;

        let read_size = match framesize {
            Some(fs) => largest_fitting_divisor(fs, budget, codec, headersize)
                .ok_or(SolveError::UnsplittableFrame(fs))?,
            None => {
                let mut chunk = budget & !7;
                if let Some(c) = codec {
                    // uncompressed chunk may exceed the wire budget by the
                    // compression factor
                    while chunk > 8 && compressed_len(chunk, 0, c) > budget {
                        chunk -= 8;
                    }
                    chunk = (chunk * 64 / c.kept() as usize) & !7;
                    while chunk > 8 && compressed_len(chunk, 0, c) > budget {
                        chunk -= 8;
                    }
                    chunk
                } else {
                    chunk
                }
            }
        };

        let compress_offset = match (codec.is_some(), framesize) {
            (true, Some(fs)) if read_size == fs => headersize,
            _ => 0,
        };
        let write_size = match codec {
            Some(c) => compressed_len(read_size, compress_offset, c),
            None => read_size,
        };

        let blocksize = match framesize {
            Some(fs) => {
                let per = (np.blocksize / fs).max(1);
                per * fs
            }
            None => {
                let per = (np.blocksize / read_size).max(1);
                per * read_size
            }
        };

        Sizes {
            blocksize,
            read_size,
            write_size,
            compress_offset,
            framesize,
            n_mtu: Some(blocksize / read_size),
        }
    } else {
        // stream transports move whole blocks; align to the framesize when
        // one is set so framing and decompression compose
        let blocksize = match framesize {
            Some(fs) => (np.blocksize / fs).max(1) * fs,
            None => np.blocksize & !7,
        };
        let mut s = Sizes::plain(blocksize);
        s.framesize = framesize;
        s
    };

    sizes.validate()?;
    Ok(sizes)
}

fn compressed_len(read_size: usize, offset: usize, codec: &Codec) -> usize {
    offset + codec.compressed_size(read_size - offset)
}

/// Largest divisor of `framesize` that is a multiple of 8 and whose
/// on-the-wire form fits the datagram budget.
fn largest_fitting_divisor(
    framesize: usize,
    budget: usize,
    codec: Option<&Codec>,
    headersize: usize,
) -> Option<usize> {
    (1..=framesize)
        .filter(|n| framesize % n == 0)
        .map(|n| framesize / n)
        .find(|&d| {
            if d % 8 != 0 {
                return false;
            }
            let offset = if d == framesize { headersize } else { 0 };
            if offset >= d {
                return false;
            }
            let wire = match codec {
                Some(c) => compressed_len(d, offset, c),
                None => d,
            };
            wire <= budget
        })
}

/// Minimum wall-clock between datagrams so the wire never carries more
/// than the source produces: payload time at the (compressed) aggregate
/// rate, in whole microseconds.
pub fn theoretical_ipd_us(total_bps: u64, wire_payload: usize, compression_factor: f64) -> u64 {
    if total_bps == 0 {
        return 0;
    }
    let effective_bps = total_bps as f64 * compression_factor;
    ((wire_payload * 8) as f64 / effective_bps * 1_000_000.0).floor() as u64
}
