use std::sync::atomic::{AtomicU64, Ordering};

/// Per-stream packet accounting of the sequenced UDP reader, shared with
/// whoever answers the statistics queries. Written from the receive thread
/// only; readers see a consistent-enough snapshot through relaxed loads.
#[derive(Debug, Default)]
pub struct PacketStats {
    pub pkt_in: AtomicU64,
    pub pkt_lost: AtomicU64,
    pub pkt_ooo: AtomicU64,
    pub pkt_disc: AtomicU64,
    /// summed reordering extent, RFC 4737 flavoured
    pub ooosum: AtomicU64,
}

impl PacketStats {
    pub fn reset(&self) {
        self.pkt_in.store(0, Ordering::Relaxed);
        self.pkt_lost.store(0, Ordering::Relaxed);
        self.pkt_ooo.store(0, Ordering::Relaxed);
        self.pkt_disc.store(0, Ordering::Relaxed);
        self.ooosum.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.pkt_in.load(Ordering::Relaxed),
            self.pkt_lost.load(Ordering::Relaxed),
            self.pkt_ooo.load(Ordering::Relaxed),
            self.pkt_disc.load(Ordering::Relaxed),
            self.ooosum.load(Ordering::Relaxed),
        )
    }
}
