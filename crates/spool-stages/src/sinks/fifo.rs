use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::Block;
use spool_chain::{Inq, StageError, SyncArgs};
use spool_timing::{Duration, Repeater};
use tracing::{debug, info, warn};

use crate::FifoIo;

pub struct FifoWriteArgs {
    pub fifo: Arc<dyn FifoIo>,
    /// above this fraction of the fifo we drop instead of write - the
    /// device wedges when driven into a full fifo
    pub hiwater_fraction: f64,
    pub skipped: Arc<AtomicU64>,
    pub counter: Arc<AtomicU64>,
}

/// Record-path sink into the vendor FIFO. Writes are skipped wholesale
/// while the FIFO sits above high-water; the loss is reported once every
/// two seconds and only while it is actually happening.
pub fn fifo_writer(inq: &Inq<Block>, sync: &SyncArgs<FifoWriteArgs>) -> Result<(), StageError> {
    let (fifo, hiwater_fraction, skipped, counter) = sync.with(|a| {
        (Arc::clone(&a.fifo), a.hiwater_fraction, Arc::clone(&a.skipped), Arc::clone(&a.counter))
    });
    let hiwater = (fifo.capacity() as f64 * hiwater_fraction) as u64;
    let mut report = Repeater::every(Duration::from_secs(2));
    let mut skipped_since_report: u64 = 0;

    info!(hiwater, "fifo writer starting");
    while let Some(b) = inq.pop() {
        if skipped_since_report > 0 {
            report.maybe(|_| {
                warn!(bytes = skipped_since_report, "fifo too full, data lost");
                skipped_since_report = 0;
            });
        }
        if fifo.occupancy() >= hiwater {
            skipped.fetch_add(b.len() as u64, Ordering::Relaxed);
            skipped_since_report += b.len() as u64;
            continue;
        }
        fifo.write(b.as_slice())
            .map_err(|e| StageError::msg(format!("fifo write: {e}")))?;
        counter.fetch_add(b.len() as u64, Ordering::Relaxed);
    }
    debug!("fifo writer stopping");
    Ok(())
}
