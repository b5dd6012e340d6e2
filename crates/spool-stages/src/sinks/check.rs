use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::Block;
use spool_chain::{Inq, StageError, SyncArgs};
use spool_timing::{Duration, Repeater};
use tracing::{debug, info, warn};

pub struct CheckArgs {
    /// expected fill word of the next block
    pub fill: u64,
    pub inc: u64,
    pub mismatches: Arc<AtomicU64>,
    pub counter: Arc<AtomicU64>,
}

/// Verification sink for the *2check transfers: expects the stream a fill
/// generator would have produced and counts every word that differs.
pub fn fill_checker(inq: &Inq<Block>, sync: &SyncArgs<CheckArgs>) -> Result<(), StageError> {
    let (mismatches, counter) = sync.with(|a| (Arc::clone(&a.mismatches), Arc::clone(&a.counter)));
    let mut report = Repeater::every(Duration::from_secs(2));

    info!("fill checker starting");
    while let Some(b) = inq.pop() {
        let expect = sync.with(|a| {
            let f = a.fill;
            a.fill = a.fill.wrapping_add(a.inc);
            f
        });
        let mut bad: u64 = 0;
        for chunk in b.as_slice().chunks_exact(8) {
            if u64::from_le_bytes(chunk.try_into().unwrap()) != expect {
                bad += 1;
            }
        }
        if bad > 0 {
            mismatches.fetch_add(bad, Ordering::Relaxed);
            report.maybe(|_| {
                warn!(words = bad, expect, "fill check mismatches in block");
            });
        }
        counter.fetch_add(b.len() as u64, Ordering::Relaxed);
    }
    debug!(
        mismatches = mismatches.load(Ordering::Relaxed),
        "fill checker stopping"
    );
    Ok(())
}

/// Swallow everything; keeps an upstream measurable without any real sink.
pub fn bitbucket(inq: &Inq<Block>, sync: &SyncArgs<Arc<AtomicU64>>) -> Result<(), StageError> {
    let counter = sync.with(|c| Arc::clone(c));
    while let Some(b) = inq.pop() {
        counter.fetch_add(b.len() as u64, Ordering::Relaxed);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use spool_blocks::Blockpool;
    use spool_chain::Chain;

    use super::*;

    fn run_checker(blocks: Vec<Vec<u8>>, fill: u64, inc: u64) -> u64 {
        let mismatches = Arc::new(AtomicU64::new(0));
        let args = CheckArgs {
            fill,
            inc,
            mismatches: Arc::clone(&mismatches),
            counter: Arc::new(AtomicU64::new(0)),
        };
        let chain = Chain::builder()
            .source("feed", 4, blocks, |out, sync| {
                sync.with(|blocks| {
                    let pool = Blockpool::new(blocks[0].len(), 4);
                    for data in blocks.iter() {
                        let mut b = pool.get();
                        b.as_mut_slice().copy_from_slice(data);
                        if !out.push(b) {
                            break;
                        }
                    }
                });
                Ok(())
            })
            .sink("check", args, fill_checker);
        chain.run().unwrap();
        chain.wait().unwrap();
        mismatches.load(Ordering::Relaxed)
    }

    #[test]
    fn clean_incrementing_stream_passes() {
        let blocks: Vec<Vec<u8>> = (0..3u64)
            .map(|i| {
                let mut v = vec![0u8; 64];
                for c in v.chunks_mut(8) {
                    c.copy_from_slice(&(500 + i).to_le_bytes());
                }
                v
            })
            .collect();
        assert_eq!(run_checker(blocks, 500, 1), 0);
    }

    #[test]
    fn corrupted_words_are_counted() {
        let mut v = vec![0u8; 64];
        for c in v.chunks_mut(8) {
            c.copy_from_slice(&7u64.to_le_bytes());
        }
        v[8] ^= 0xff; // word 1 broken
        v[56] ^= 0x01; // word 7 broken
        assert_eq!(run_checker(vec![v], 7, 0), 2);
    }
}
