use std::sync::Arc;

use spool_blocks::Block;
use spool_chain::{Chain, Queue, StepId};
use spool_format::{FormatError, HeaderSearch, TrackFormat};
use spool_stages::{DiskRead, FifoIo, PacketStats, Sizes};

use crate::{
    BlockDevice, CounterRegistry, DeviceClass, IoBoard, NetParms, SubMode, TransferMode,
    constraints::{SolveError, solve_sizes},
    trackmask::TrackmaskState,
};

/// The chain currently installed, plus the step ids the command side needs
/// for its deferred parameter updates.
pub struct ActiveTransfer {
    pub chain: Chain,
    /// the stage that accepts run/start/end/repeat updates
    pub producer_step: StepId,
    /// sink-side step for the odd query (mem2time's grabber)
    pub sink_step: StepId,
}

/// Half-open byte range into the recording driven by the play commands.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlayRange {
    pub start: u64,
    pub end: u64,
}

/// Everything one device's transfers share: the vendor device handles, the
/// network parameters, the current mode configuration, the installed
/// chain, and the statistics. One runtime runs at most one transfer.
pub struct Runtime {
    pub class: DeviceClass,
    pub device: Arc<dyn BlockDevice>,
    pub disk: Arc<dyn DiskRead>,
    pub fifo: Arc<dyn FifoIo>,
    pub board: IoBoard,
    pub netparms: NetParms,
    pub counters: Arc<CounterRegistry>,
    pub packet_stats: Arc<PacketStats>,

    pub trackformat: TrackFormat,
    pub ntrack: u32,
    pub trackbitrate: u64,

    pub mode: TransferMode,
    pub submode: SubMode,
    pub transfer: Option<ActiveTransfer>,
    pub play: PlayRange,
    pub trackmask: TrackmaskState,

    /// boundary queue of the in2mem/mem2net family
    pub interchain: Option<Queue<Block>>,

    /// mode-scoped scratch, cleared on return to no_transfer
    pub last_host: String,
    pub last_file: String,
}

impl Runtime {
    pub fn new<D>(class: DeviceClass, device: Arc<D>) -> Self
    where
        D: BlockDevice + 'static,
    {
        Runtime {
            class,
            disk: Arc::clone(&device) as Arc<dyn DiskRead>,
            fifo: Arc::clone(&device) as Arc<dyn FifoIo>,
            device,
            board: IoBoard::default(),
            netparms: NetParms::default(),
            counters: Arc::new(CounterRegistry::default()),
            packet_stats: Arc::new(PacketStats::default()),
            trackformat: TrackFormat::None,
            ntrack: 0,
            trackbitrate: 8_000_000,
            mode: TransferMode::NoTransfer,
            submode: SubMode::empty(),
            transfer: None,
            play: PlayRange::default(),
            trackmask: TrackmaskState::default(),
            interchain: None,
            last_host: String::new(),
            last_file: String::new(),
        }
    }

    /// The header descriptor of the configured mode, if it can be framed.
    pub fn header(&self) -> Result<HeaderSearch, FormatError> {
        HeaderSearch::new(self.trackformat, self.ntrack, self.trackbitrate)
    }

    /// Aggregate nominal data rate in bits per second.
    pub fn total_bps(&self) -> u64 {
        self.ntrack as u64 * self.trackbitrate
    }

    /// Run the constraint solver against the current mode configuration.
    pub fn solve_sizes(&self) -> Result<Sizes, SolveError> {
        let header = self.header().ok();
        solve_sizes(
            &self.netparms,
            header.map(|h| h.framesize),
            header.map(|h| h.headersize).unwrap_or(0),
            self.trackmask.codec().as_ref(),
        )
    }

    pub fn fifo_fill(&self) -> f64 {
        let cap = self.fifo.capacity();
        if cap == 0 {
            0.0
        } else {
            self.fifo.occupancy() as f64 / cap as f64
        }
    }

    /// Drop back to idle: chain gone, submode cleared, mode-scoped scratch
    /// forgotten. Always safe to call, also after a failed teardown. The
    /// interchain queue deliberately survives - its backlog is what a
    /// follow-up mem2net/mem2file transfer comes for.
    pub fn to_idle(&mut self) {
        self.mode = TransferMode::NoTransfer;
        self.submode = SubMode::empty();
        self.transfer = None;
        self.last_host.clear();
        self.last_file.clear();
        self.counters.clear();
    }
}

#[cfg(test)]
mod test {
    use crate::RamPack;

    use super::*;

    #[test]
    fn fresh_runtime_is_idle() {
        let rt = Runtime::new(DeviceClass::Generic, Arc::new(RamPack::default()));
        assert!(rt.mode.is_idle());
        assert!(rt.transfer.is_none());
        assert_eq!(rt.fifo_fill(), 0.0);
        assert!(rt.header().is_err());
    }

    #[test]
    fn mode_config_drives_the_header() {
        let mut rt = Runtime::new(DeviceClass::Generic, Arc::new(RamPack::default()));
        rt.trackformat = TrackFormat::Mark5B;
        rt.ntrack = 32;
        rt.trackbitrate = 32_000_000;
        let h = rt.header().unwrap();
        assert_eq!(h.framesize, 10_016);
        assert_eq!(rt.total_bps(), 1_024_000_000);
        rt.solve_sizes().unwrap();
    }
}
