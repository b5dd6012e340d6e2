use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Outq, StageError, SyncArgs};
use spool_timing::{Duration, Repeater};
use tracing::{debug, info, warn};

use crate::{FifoIo, Sizes};

/// Emergency-drain read size. Large enough that draining makes progress
/// regardless of the configured blocksize.
const DRAIN_CHUNK: usize = 1024 * 1024;

pub struct FifoReadArgs {
    pub run: bool,
    pub fifo: Arc<dyn FifoIo>,
    pub sizes: Sizes,
    pub counter: Arc<AtomicU64>,
    /// bytes thrown away by emergency drains
    pub discarded: Arc<AtomicU64>,
    /// fraction of the fifo above which we drain instead of forwarding
    pub hiwater_fraction: f64,
}

/// Record path source: move data out of the vendor streaming FIFO into
/// blocks. If downstream cannot keep up and the FIFO climbs past the
/// high-water mark, read-and-discard until it is back under - stalling the
/// FIFO wedges the whole device, losing data does not.
pub fn fifo_reader(out: &Outq<Block>, sync: &SyncArgs<FifoReadArgs>) -> Result<(), StageError> {
    if !sync.wait(|a| a.run) {
        debug!("cancelled before starting");
        return Ok(());
    }
    let (sizes, fifo, counter, discarded, hiwater_fraction) = sync.with(|a| {
        (a.sizes, Arc::clone(&a.fifo), Arc::clone(&a.counter), Arc::clone(&a.discarded), a.hiwater_fraction)
    });
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;

    let hiwater = (fifo.capacity() as f64 * hiwater_fraction) as u64;
    let pool = Blockpool::new(sizes.blocksize, 16);
    let mut drain_buf = vec![0u8; DRAIN_CHUNK];
    let mut report = Repeater::every(Duration::from_secs(2));
    let mut drained_since_report: u64 = 0;

    info!(hiwater, blocksize = sizes.blocksize, "fifo reader starting");
    while !sync.cancelled() {
        // emergency drains first: the device must never fill up
        while fifo.occupancy() > hiwater {
            fifo.read(&mut drain_buf)
                .map_err(|e| StageError::msg(format!("fifo drain: {e}")))?;
            discarded.fetch_add(DRAIN_CHUNK as u64, Ordering::Relaxed);
            drained_since_report += DRAIN_CHUNK as u64;
        }
        if drained_since_report > 0 {
            report.maybe(|_| {
                warn!(bytes = drained_since_report, "fifo over high-water, data discarded");
                drained_since_report = 0;
            });
        }

        if fifo.occupancy() < sizes.blocksize as u64 {
            std::thread::sleep(std::time::Duration::from_micros(100));
            continue;
        }

        let mut b = pool.get();
        fifo.read(b.as_mut_slice())
            .map_err(|e| StageError::msg(format!("fifo read: {e}")))?;
        if !out.push(b) {
            break;
        }
        counter.fetch_add(sizes.blocksize as u64, Ordering::Relaxed);
    }
    debug!("fifo reader stopping");
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{collections::VecDeque, io, sync::Mutex};

    use spool_chain::Chain;

    use super::*;

    /// Byte fifo fed from a preloaded script.
    struct ScriptFifo {
        data: Mutex<VecDeque<u8>>,
        capacity: u64,
    }

    impl FifoIo for ScriptFifo {
        fn capacity(&self) -> u64 {
            self.capacity
        }

        fn occupancy(&self) -> u64 {
            self.data.lock().unwrap().len() as u64
        }

        fn read(&self, buf: &mut [u8]) -> io::Result<()> {
            let mut data = self.data.lock().unwrap();
            for slot in buf.iter_mut() {
                *slot = data.pop_front().unwrap_or(0);
            }
            Ok(())
        }

        fn write(&self, buf: &[u8]) -> io::Result<()> {
            self.data.lock().unwrap().extend(buf.iter().copied());
            Ok(())
        }
    }

    #[test]
    fn forwards_blocks_and_stops_on_cancel() {
        let fifo = Arc::new(ScriptFifo { data: Mutex::new(VecDeque::new()), capacity: 1 << 20 });
        fifo.write(&vec![0xabu8; 4096]).unwrap();

        let got = Arc::new(AtomicU64::new(0));
        let sink_got = Arc::clone(&got);
        let args = FifoReadArgs {
            run: false,
            fifo: Arc::clone(&fifo) as Arc<dyn FifoIo>,
            sizes: Sizes::plain(1024),
            counter: Arc::new(AtomicU64::new(0)),
            discarded: Arc::new(AtomicU64::new(0)),
            hiwater_fraction: 0.6,
        };
        let chain = Chain::builder()
            .source("fifo", 4, args, fifo_reader)
            .sink("count", (), move |inq, _| {
                while let Some(b) = inq.pop() {
                    sink_got.fetch_add(b.len() as u64, Ordering::Relaxed);
                }
                Ok(())
            });
        chain.run().unwrap();
        chain.communicate::<FifoReadArgs, _>(0, |a| a.run = true).unwrap();
        while got.load(Ordering::Relaxed) < 4096 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        chain.stop().unwrap();
        assert_eq!(got.load(Ordering::Relaxed) % 1024, 0);
    }

    #[test]
    fn drains_above_hiwater() {
        // tiny fifo, loaded to the brim; hiwater at 60% of 1 MiB means the
        // reader drains before forwarding
        let fifo = Arc::new(ScriptFifo {
            data: Mutex::new(VecDeque::new()),
            capacity: 2 * DRAIN_CHUNK as u64,
        });
        fifo.write(&vec![1u8; 2 * DRAIN_CHUNK]).unwrap();

        let discarded = Arc::new(AtomicU64::new(0));
        let args = FifoReadArgs {
            run: false,
            fifo: Arc::clone(&fifo) as Arc<dyn FifoIo>,
            sizes: Sizes::plain(1024),
            counter: Arc::new(AtomicU64::new(0)),
            discarded: Arc::clone(&discarded),
            hiwater_fraction: 0.5,
        };
        let chain = Chain::builder()
            .source("fifo", 2, args, fifo_reader)
            .sink("swallow", (), |inq, _| {
                while inq.pop().is_some() {}
                Ok(())
            });
        chain.run().unwrap();
        chain.communicate::<FifoReadArgs, _>(0, |a| a.run = true).unwrap();
        while discarded.load(Ordering::Relaxed) == 0 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        chain.stop().unwrap();
        assert!(discarded.load(Ordering::Relaxed) >= DRAIN_CHUNK as u64);
    }
}
