use std::collections::HashMap;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::Block;
use spool_chain::{Inq, Queue, StageError, SyncArgs, TryPush};
use spool_net::{
    FdGuard, NetProtocol, is_cancelled, net_client, open_file, send_seq_payload,
};
use tracing::{debug, info, warn};

use crate::Tagged;
use crate::fdio::write_full;

/// Where a tag's data goes: "host:port" over the configured protocol, or
/// "path,mode" into a file.
#[derive(Clone, Debug)]
pub struct MultiArgs {
    pub dest_by_tag: HashMap<u32, String>,
    pub proto: NetProtocol,
    pub lane_depth: usize,
    pub counter: Arc<AtomicU64>,
}

struct Lane {
    queue: Queue<Block>,
    handle: std::thread::JoinHandle<()>,
    guard: Arc<FdGuard>,
}

/// Route a tagged stream to per-destination writer lanes. One descriptor
/// and one inner writer thread per distinct destination; tags sharing a
/// destination share the lane. Unknown tags are dropped silently; a full
/// lane for a known tag is fatal, because silently stalling one channel
/// would skew the whole split set.
pub fn multi_writer(
    inq: &Inq<Tagged<Block>>,
    sync: &SyncArgs<MultiArgs>,
) -> Result<(), StageError> {
    let args = sync.with(|a| a.clone());

    // open each distinct destination once
    let mut lane_of_dest: HashMap<String, usize> = HashMap::new();
    let mut lanes: Vec<Lane> = Vec::new();
    let mut lane_of_tag: HashMap<u32, usize> = HashMap::new();

    let wind_down = |lanes: Vec<Lane>| {
        for lane in &lanes {
            lane.queue.disable();
        }
        for lane in lanes {
            let _ = lane.handle.join();
            lane.guard.close();
        }
    };

    for (&tag, dest) in &args.dest_by_tag {
        let lane_idx = match lane_of_dest.get(dest) {
            Some(&idx) => idx,
            None => {
                let opened = open_dest(dest, args.proto).and_then(|guard| {
                    let queue: Queue<Block> = Queue::new(args.lane_depth);
                    spawn_lane(dest, args.proto, Arc::clone(&guard), queue.clone())
                        .map(|handle| Lane { queue, handle, guard })
                });
                match opened {
                    Ok(lane) => lanes.push(lane),
                    Err(e) => {
                        wind_down(lanes);
                        return Err(e);
                    }
                }
                let idx = lanes.len() - 1;
                lane_of_dest.insert(dest.clone(), idx);
                idx
            }
        };
        lane_of_tag.insert(tag, lane_idx);
    }
    info!(
        destinations = lanes.len(),
        tags = lane_of_tag.len(),
        "multi writer routing"
    );

    let mut routed: u64 = 0;
    let mut dropped: u64 = 0;
    let mut result = Ok(());
    while let Some(t) = inq.pop() {
        let Some(&idx) = lane_of_tag.get(&t.tag) else {
            dropped += 1;
            continue;
        };
        let len = t.item.len() as u64;
        match lanes[idx].queue.try_push(t.item) {
            Ok(()) => {
                routed += 1;
                args.counter.fetch_add(len, Ordering::Relaxed);
            }
            Err(TryPush::Disabled(_)) => break,
            Err(TryPush::Full(_)) => {
                result = Err(StageError::msg(format!(
                    "destination lane for tag {} cannot keep up",
                    t.tag
                )));
                break;
            }
        }
    }

    // let the lanes finish their backlog before reporting anything
    for lane in &lanes {
        lane.queue.delayed_disable();
    }
    for lane in lanes {
        let _ = lane.handle.join();
        lane.guard.close();
    }
    debug!(routed, dropped, "multi writer stopping");
    result
}

fn open_dest(dest: &str, proto: NetProtocol) -> Result<Arc<FdGuard>, StageError> {
    if dest.contains(',') {
        let opened = open_file(dest).map_err(|e| StageError::msg(e.to_string()))?;
        return Ok(opened.guard);
    }
    let (host, port) = dest
        .rsplit_once(':')
        .ok_or_else(|| StageError::msg(format!("destination '{dest}' is neither file nor host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| StageError::msg(format!("bad port in destination '{dest}'")))?;
    let sock = net_client(proto, host, port, None, None)
        .map_err(|e| StageError::msg(format!("connecting '{dest}': {e}")))?;
    Ok(sock.guard)
}

fn spawn_lane(
    dest: &str,
    proto: NetProtocol,
    guard: Arc<FdGuard>,
    queue: Queue<Block>,
) -> Result<std::thread::JoinHandle<()>, StageError> {
    let sequenced = matches!(proto, NetProtocol::Udps | NetProtocol::Vtp) && !dest.contains(',');
    let name = format!("lane-{dest}");
    spool_utils::spawn_stage(&name, move || {
        let mut seqnr: u64 = rand::random::<u32>() as u64;
        while let Some(b) = queue.pop() {
            let sent = if sequenced {
                send_seq_payload(guard.fd(), seqnr, b.as_slice())
            } else {
                write_full(guard.fd(), b.as_slice())
            };
            match sent {
                Ok(()) => seqnr += 1,
                Err(e) if is_cancelled(&e) => break,
                Err(e) => {
                    warn!(%e, "lane write failed, lane dying");
                    queue.disable();
                    break;
                }
            }
        }
    })
    .map_err(|e| StageError::msg(format!("spawning lane: {e}")))
}

#[cfg(test)]
mod test {
    use spool_blocks::Blockpool;
    use spool_chain::Chain;

    use super::*;

    #[test]
    fn routes_tags_to_their_files_and_drops_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("chan-a.bin");
        let b = dir.path().join("chan-b.bin");

        let mut dest_by_tag = HashMap::new();
        dest_by_tag.insert(0u32, format!("{},w", a.display()));
        dest_by_tag.insert(1u32, format!("{},w", b.display()));

        let args = MultiArgs {
            dest_by_tag,
            proto: NetProtocol::Tcp,
            lane_depth: 8,
            counter: Arc::new(AtomicU64::new(0)),
        };
        let pool = Blockpool::new(32, 8);
        let chain = Chain::builder()
            .source("feed", 8, pool, |out, sync| {
                sync.with(|pool| {
                    for (tag, fillbyte) in [(0u32, 0xaau8), (1, 0xbb), (0, 0xac), (7, 0x99)] {
                        let mut blk = pool.get();
                        blk.as_mut_slice().fill(fillbyte);
                        if !out.push(Tagged::new(tag, blk)) {
                            break;
                        }
                    }
                });
                Ok(())
            })
            .sink("multi", args, multi_writer);
        chain.run().unwrap();
        chain.wait().unwrap();

        let got_a = std::fs::read(&a).unwrap();
        let got_b = std::fs::read(&b).unwrap();
        // tag 0 wrote twice, tag 1 once, tag 7 went nowhere
        assert_eq!(got_a.len(), 64);
        assert!(got_a[..32].iter().all(|&x| x == 0xaa));
        assert!(got_a[32..].iter().all(|&x| x == 0xac));
        assert_eq!(got_b.len(), 32);
        assert!(got_b.iter().all(|&x| x == 0xbb));
    }

    #[test]
    fn shared_destination_means_shared_lane() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("both.bin");

        let mut dest_by_tag = HashMap::new();
        dest_by_tag.insert(0u32, format!("{},w", shared.display()));
        dest_by_tag.insert(1u32, format!("{},w", shared.display()));

        let args = MultiArgs {
            dest_by_tag,
            proto: NetProtocol::Tcp,
            lane_depth: 8,
            counter: Arc::new(AtomicU64::new(0)),
        };
        let pool = Blockpool::new(16, 4);
        let chain = Chain::builder()
            .source("feed", 4, pool, |out, sync| {
                sync.with(|pool| {
                    for tag in [0u32, 1] {
                        let mut blk = pool.get();
                        blk.as_mut_slice().fill(tag as u8 + 1);
                        if !out.push(Tagged::new(tag, blk)) {
                            break;
                        }
                    }
                });
                Ok(())
            })
            .sink("multi", args, multi_writer);
        chain.run().unwrap();
        chain.wait().unwrap();

        // both tags landed in the one file, in order
        assert_eq!(std::fs::read(&shared).unwrap().len(), 32);
    }
}
