use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::Block;
use spool_chain::{Inq, StageError, SyncArgs};
use spool_net::{SEQ_SIZE, is_cancelled, send_seq_payload};
use spool_timing::{Duration, Pacer};
use tracing::{debug, info, warn};

use crate::fdio::write_full;
use crate::sinks::net::NetWriteArgs;

fn effective_ipd(sync: &SyncArgs<NetWriteArgs>) -> Duration {
    let (set, theoretical) = sync.with(|a| (a.ipd_us, a.theoretical_ipd_us));
    if set < 0 {
        Duration::from_micros(theoretical)
    } else {
        Duration::from_micros(set as u64)
    }
}

/// Sequenced UDP sender: every write_size chunk of every block leaves as
/// one datagram of 8-byte sequence number plus payload, paced at the
/// inter-packet delay. A negative configured IPD selects the theoretical
/// one derived from the data rate; pacing limits bursts so switches and
/// the receiver are not overrun.
pub fn udps_writer(inq: &Inq<Block>, sync: &SyncArgs<NetWriteArgs>) -> Result<(), StageError> {
    let (fd, sizes, counter) =
        sync.with(|a| (Arc::clone(&a.fd), a.sizes, Arc::clone(&a.counter)));
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;
    let wr = sizes.write_size;

    // random start so no receiver can assume anything but monotonicity
    let mut seqnr: u64 = rand::random::<u32>() as u64;
    let mut pacer = Pacer::new();
    let mut last_ipd = Duration::MAX;

    info!(fd = fd.fd(), first_seq = seqnr, datagram = SEQ_SIZE + wr, "udps writer starting");
    let mut nbyte: u64 = 0;
    while let Some(b) = inq.pop() {
        if sync.cancelled() || fd.is_closed() {
            break;
        }
        let ipd = effective_ipd(sync);
        if ipd != last_ipd {
            debug!(ipd_us = ipd.as_micros(), "inter-packet delay");
            last_ipd = ipd;
        }
        let bytes = b.as_slice();
        let mut pos = 0usize;
        while pos + wr <= bytes.len() {
            pacer.pace(ipd);
            match send_seq_payload(fd.fd(), seqnr, &bytes[pos..pos + wr]) {
                Ok(()) => {}
                Err(e) if is_cancelled(&e) => return Ok(()),
                Err(e) => return Err(StageError::msg(format!("sendmsg: {e}"))),
            }
            seqnr += 1;
            pos += wr;
            nbyte += wr as u64;
            counter.fetch_add((SEQ_SIZE + wr) as u64, Ordering::Relaxed);
        }
        if pos != bytes.len() {
            warn!(
                block = bytes.len(),
                pkt = wr,
                "block is not a whole number of datagrams, tail dropped"
            );
        }
    }
    debug!(nbyte, "udps writer stopping");
    Ok(())
}

/// Same pacing, no sequence numbers: bare write_size datagrams.
pub fn udp_writer(inq: &Inq<Block>, sync: &SyncArgs<NetWriteArgs>) -> Result<(), StageError> {
    let (fd, sizes, counter) =
        sync.with(|a| (Arc::clone(&a.fd), a.sizes, Arc::clone(&a.counter)));
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;
    let wr = sizes.write_size;
    let mut pacer = Pacer::new();

    info!(fd = fd.fd(), pkt = wr, "udp writer starting");
    while let Some(b) = inq.pop() {
        if sync.cancelled() || fd.is_closed() {
            break;
        }
        let ipd = effective_ipd(sync);
        let bytes = b.as_slice();
        let mut pos = 0usize;
        while pos + wr <= bytes.len() {
            pacer.pace(ipd);
            match write_full(fd.fd(), &bytes[pos..pos + wr]) {
                Ok(()) => {}
                Err(e) if is_cancelled(&e) => return Ok(()),
                Err(e) => return Err(StageError::msg(format!("send: {e}"))),
            }
            pos += wr;
            counter.fetch_add(wr as u64, Ordering::Relaxed);
        }
    }
    debug!("udp writer stopping");
    Ok(())
}

/// VTP sender: one whole block (a framed unit, e.g. one VDIF frame) per
/// datagram, sequence-prefixed, paced.
pub fn vtp_writer(inq: &Inq<Block>, sync: &SyncArgs<NetWriteArgs>) -> Result<(), StageError> {
    let (fd, counter) = sync.with(|a| (Arc::clone(&a.fd), Arc::clone(&a.counter)));
    let mut seqnr: u64 = rand::random::<u32>() as u64;
    let mut pacer = Pacer::new();

    info!(fd = fd.fd(), first_seq = seqnr, "vtp writer starting");
    while let Some(b) = inq.pop() {
        if sync.cancelled() || fd.is_closed() {
            break;
        }
        pacer.pace(effective_ipd(sync));
        match send_seq_payload(fd.fd(), seqnr, b.as_slice()) {
            Ok(()) => {}
            Err(e) if is_cancelled(&e) => return Ok(()),
            Err(e) => return Err(StageError::msg(format!("sendmsg: {e}"))),
        }
        seqnr += 1;
        counter.fetch_add((SEQ_SIZE + b.len()) as u64, Ordering::Relaxed);
    }
    debug!("vtp writer stopping");
    Ok(())
}
