use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Inq, Outq, StageError, SyncArgs};
use spool_format::{FILL_PATTERN, VdifHeader, write_fill};
use spool_net::{
    AckRotation, FdGuard, is_cancelled, peek_seqnr, recv_into, recv_seq_payload, send_ack,
};
use tracing::{debug, info, warn};

use crate::{PacketStats, Sizes};

/// Recent packet sequence numbers for the RFC 4737 reordering-extent
/// approximation.
const PSN_RING: usize = 32;

/// What travels from the bottom half to the top half: a block whose
/// backing also carries one flag byte per datagram slot (offset blocksize
/// onward), plus how many data bytes of it are real. The flags tell the
/// top half which slots arrived and which need fill pattern.
pub struct FlaggedBlock {
    pub block: Block,
    pub data_len: usize,
}

pub struct UdpsArgs {
    pub fd: Arc<FdGuard>,
    pub sizes: Sizes,
    /// blocks buffered beyond the currently-filling one, to tolerate
    /// reordering
    pub readahead: usize,
    /// send one ACK datagram per this many received packets; 0 suppresses
    /// the back-traffic entirely
    pub ack_period: u32,
    /// flush a short terminal block downstream instead of dropping it
    pub allow_variable_block_size: bool,
    pub stats: Arc<PacketStats>,
    pub counter: Arc<AtomicU64>,
}

struct Ring {
    slots: Vec<Option<Block>>,
    pool: Blockpool,
    blocksize: usize,
    stride: usize,
    n_dg: usize,
}

impl Ring {
    /// Block for ring position `idx`, allocating with cleared flags on
    /// first touch.
    fn ensure(&mut self, idx: usize) -> &mut Block {
        if self.slots[idx].is_none() {
            let mut b = self.pool.get();
            b.as_mut_slice()[self.blocksize..self.blocksize + self.n_dg].fill(0);
            self.slots[idx] = Some(b);
        }
        self.slots[idx].as_mut().unwrap()
    }

    fn clear_flags_count_discards(&mut self) -> u64 {
        let mut discarded = 0;
        for slot in self.slots.iter_mut().flatten() {
            let flags = &mut slot.as_mut_slice()[self.blocksize..self.blocksize + self.n_dg];
            discarded += flags.iter().filter(|&&f| f != 0).count() as u64;
            flags.fill(0);
        }
        discarded
    }

    /// Retire position 0 downstream (if it ever got data) and shift.
    fn shift(&mut self, out: &Outq<FlaggedBlock>) -> bool {
        if let Some(b) = self.slots.remove(0) {
            if !out.push(FlaggedBlock { block: b, data_len: self.blocksize }) {
                return false;
            }
        }
        self.slots.push(None);
        true
    }
}

/// Bottom half of the sequenced-UDP reader, the hot loop of the whole
/// system: peek the next sequence number, decide where the datagram lands
/// in the readahead ring, then receive header+payload straight into that
/// slot. Each arriving datagram touches memory exactly once; missing slots
/// are repaired later by the top half so this loop never branches on
/// packet-present.
pub fn udps_bottom_half(
    out: &Outq<FlaggedBlock>,
    sync: &SyncArgs<UdpsArgs>,
) -> Result<(), StageError> {
    let (fd, sizes, readahead, ack_period, avbs, stats, counter) = sync.with(|a| {
        (
            Arc::clone(&a.fd),
            a.sizes,
            a.readahead.max(1),
            a.ack_period,
            a.allow_variable_block_size,
            Arc::clone(&a.stats),
            Arc::clone(&a.counter),
        )
    });
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;

    // slot stride is the uncompressed chunk; only the leading write_size
    // bytes of each slot arrive off the wire
    let stride = sizes.read_size;
    let payload = sizes.write_size;
    let n_dg = sizes.blocksize / stride;
    let datagram_bytes = (spool_net::SEQ_SIZE + payload) as u64;

    stats.reset();
    let mut ring = Ring {
        slots: (0..readahead).map(|_| None).collect(),
        pool: Blockpool::new(sizes.blocksize + n_dg, if sizes.blocksize >= 32 << 20 { 2 } else { 32 }),
        blocksize: sizes.blocksize,
        stride,
        n_dg,
    };
    let mut dummy = vec![0u8; 65536];
    let mut acks = AckRotation::new();
    let mut psn: Vec<u64> = Vec::with_capacity(PSN_RING);

    // wait for the very first datagram so the loop below starts anchored
    let (mut seqnr, mut sender) = match peek_seqnr(fd.fd()) {
        Ok(v) => v,
        Err(e) if is_cancelled(&e) => {
            debug!("cancelled waiting for the first datagram");
            return Ok(());
        }
        Err(e) => return Err(StageError::msg(format!("first peek: {e}"))),
    };
    let mut first = seqnr;
    let mut expect = seqnr;
    let mut minseq = seqnr;
    let mut maxseq = seqnr;
    let mut ack_left: i64 = 0; // trigger an immediate first ack

    info!(
        fd = fd.fd(),
        first_seq = seqnr,
        payload,
        readahead,
        pkts_per_block = n_dg,
        avbs,
        "udps reader starting"
    );

    let flush = |ring: &mut Ring, first: u64, maxseq: u64| {
        // full blocks always go downstream; the short terminal one only
        // when variable-size blocks are allowed
        let mut start = first;
        for i in 0..readahead {
            if start > maxseq {
                break;
            }
            if let Some(b) = ring.slots[i].take() {
                let pkts = ((maxseq + 1 - start) as usize).min(n_dg);
                let sz = pkts * stride;
                if sz == sizes.blocksize || avbs {
                    if !out.push(FlaggedBlock { block: b, data_len: sz }) {
                        break;
                    }
                }
            }
            start += n_dg as u64;
        }
    };

    loop {
        let behind = seqnr < first;
        let late = behind && (first - seqnr) <= n_dg as u64;
        let resync = behind && !late;

        stats.pkt_in.fetch_add(1, Ordering::Relaxed);

        // reordering accounting, RFC 4737 4.2.2 against the recent window
        if seqnr >= expect {
            expect = seqnr + 1;
        } else {
            stats.pkt_ooo.fetch_add(1, Ordering::Relaxed);
            let ahead = psn.iter().filter(|&&p| p >= seqnr).count() as u64;
            stats.ooosum.fetch_add(ahead, Ordering::Relaxed);
        }
        if psn.len() == PSN_RING {
            psn.remove(0);
        }
        psn.push(seqnr);

        if resync {
            // sender restarted its numbering: drop what we were
            // assembling and re-anchor on this packet
            let discarded = ring.clear_flags_count_discards();
            stats.pkt_disc.fetch_add(discarded, Ordering::Relaxed);
            stats.pkt_in.store(1, Ordering::Relaxed);
            psn.clear();
            first = seqnr;
            expect = seqnr;
            minseq = seqnr;
            maxseq = seqnr;
            warn!(new_first = seqnr, discarded, "sequence number stream resynced");
        }
        if late {
            stats.pkt_disc.fetch_add(1, Ordering::Relaxed);
        }
        maxseq = maxseq.max(seqnr);
        minseq = minseq.min(seqnr);
        // duplicates can push pkt_in past the span, hence the saturation
        let lost = (maxseq - minseq + 1).saturating_sub(stats.pkt_in.load(Ordering::Relaxed));
        stats.pkt_lost.store(lost, Ordering::Relaxed);

        // find the datagram a home (or the discard buffer)
        let mut target: Option<(usize, usize)> = None;
        if !late {
            let mut shifts = 0;
            loop {
                let off = seqnr - first;
                let blockidx = (off / n_dg as u64) as usize;
                if blockidx < readahead {
                    target = Some((blockidx, (off % n_dg as u64) as usize));
                    break;
                }
                if !ring.shift(out) {
                    debug!("downstream gone, udps reader stopping");
                    return Ok(());
                }
                first += n_dg as u64;
                shifts += 1;
                if shifts == readahead {
                    debug!(jump = seqnr - first, "jump beyond readahead, re-anchoring");
                    first = seqnr;
                }
            }
        }

        // receive for real, straight into place
        let recv_result = match target {
            Some((blockidx, pktidx)) => {
                let block = ring.ensure(blockidx);
                let base = pktidx * stride;
                let buf = block.as_mut_slice();
                let r = recv_seq_payload(fd.fd(), &mut buf[base..base + payload]);
                if r.is_ok() {
                    buf[sizes.blocksize + pktidx] = 1;
                }
                r.map(|_| ())
            }
            None => recv_into(fd.fd(), &mut dummy[..spool_net::SEQ_SIZE + payload]).map(|_| ()),
        };
        if let Err(e) = recv_result {
            flush(&mut ring, first, maxseq);
            if is_cancelled(&e) {
                debug!("udps reader cancelled");
                return Ok(());
            }
            return Err(StageError::msg(format!("recvmsg: {e}")));
        }
        counter.fetch_add(datagram_bytes, Ordering::Relaxed);

        // ACK back-traffic keeps ARP/NAT state warm along the path
        if ack_period > 0 {
            ack_left -= 1;
            if ack_left <= 0 {
                if let Some(to) = sender {
                    if send_ack(fd.fd(), to, acks.next_payload()).is_err() {
                        warn!("failed to send ACK back to sender");
                    }
                }
                ack_left = ack_period as i64;
            }
        }

        // and wait for the next one
        match peek_seqnr(fd.fd()) {
            Ok((s, from)) => {
                seqnr = s;
                if from.is_some() {
                    sender = from;
                }
            }
            Err(e) => {
                flush(&mut ring, first, maxseq);
                if is_cancelled(&e) {
                    debug!("udps reader cancelled");
                    return Ok(());
                }
                return Err(StageError::msg(format!("peek: {e}")));
            }
        }
    }
}

pub struct UdpsTopArgs {
    pub sizes: Sizes,
    /// payload is VDIF: lost slots get an invalid-marked VDIF header
    /// instead of bare fill pattern
    pub expect_vdif: bool,
    pub counter: Arc<AtomicU64>,
}

/// Top half: walk the per-slot flags and repair the holes. Arrived slots
/// are left alone; missing slots get fill pattern (or an invalid VDIF
/// frame); when the transport was compressed, the slack between write_size
/// and read_size is zeroed unconditionally because the bit-moving
/// decompressor may only OR into zeroed space.
pub fn udps_top_half(
    inq: &Inq<FlaggedBlock>,
    out: &Outq<Block>,
    sync: &SyncArgs<UdpsTopArgs>,
) -> Result<(), StageError> {
    let (sizes, expect_vdif, counter) =
        sync.with(|a| (a.sizes, a.expect_vdif, Arc::clone(&a.counter)));
    let stride = sizes.read_size;
    let payload = sizes.write_size;
    let n_dg = sizes.blocksize / stride;

    // prototype replacement for a missing slot
    let mut proto = vec![0u8; payload];
    write_fill(&mut proto, FILL_PATTERN);
    if expect_vdif {
        proto[..16].copy_from_slice(&VdifHeader::invalid_marker(payload).to_bytes());
        info!("lost datagrams will carry an invalid-marked VDIF header");
    }

    while let Some(FlaggedBlock { mut block, data_len }) = inq.pop() {
        let slots = data_len / stride;
        for i in 0..slots {
            let flag = block.as_slice()[sizes.blocksize + i];
            let base = i * stride;
            let buf = block.as_mut_slice();
            if flag == 0 {
                buf[base..base + payload].copy_from_slice(&proto);
            }
            if payload < stride {
                buf[base + payload..base + stride].fill(0);
            }
        }
        let clean = block.sub(0, data_len.min(sizes.blocksize));
        if !out.push(clean) {
            break;
        }
        counter.fetch_add(data_len as u64, Ordering::Relaxed);
    }
    debug!("udps top half stopping");
    Ok(())
}
