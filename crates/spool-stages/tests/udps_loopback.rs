//! Loopback tests of the sequenced-UDP receive pipeline: ordering, loss
//! repair, reordering tolerance and the end-to-end file replica.

use std::{
    net::UdpSocket,
    os::fd::{AsRawFd, IntoRawFd},
    sync::{
        Arc, Mutex,
        atomic::AtomicU64,
    },
    time::{Duration, Instant},
};

use spool_blocks::Block;
use spool_chain::{Chain, Inq, StageError, SyncArgs};
use spool_format::FILL_PATTERN;
use spool_net::{FdGuard, send_seq_payload};
use spool_stages::{
    PacketStats, Sizes,
    sources::{UdpsArgs, UdpsTopArgs, udps_bottom_half, udps_top_half},
};

const WR: usize = 1024;
const DGS_PER_BLOCK: usize = 4;

fn sizes() -> Sizes {
    Sizes {
        blocksize: DGS_PER_BLOCK * WR,
        read_size: WR,
        write_size: WR,
        compress_offset: 0,
        framesize: None,
        n_mtu: Some(DGS_PER_BLOCK),
    }
}

struct Receiver {
    chain: Chain,
    stats: Arc<PacketStats>,
    collected: Arc<Mutex<Vec<u8>>>,
    tx: UdpSocket,
}

fn start_receiver(readahead: usize) -> Receiver {
    let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest = rx.local_addr().unwrap();
    let guard = Arc::new(FdGuard::new(rx.into_raw_fd()));
    let stats = Arc::new(PacketStats::default());
    let collected = Arc::new(Mutex::new(Vec::new()));

    let bottom = UdpsArgs {
        fd: Arc::clone(&guard),
        sizes: sizes(),
        readahead,
        ack_period: 0,
        allow_variable_block_size: true,
        stats: Arc::clone(&stats),
        counter: Arc::new(AtomicU64::new(0)),
    };
    let top = UdpsTopArgs {
        sizes: sizes(),
        expect_vdif: false,
        counter: Arc::new(AtomicU64::new(0)),
    };
    let sink_buf = Arc::clone(&collected);
    let collect = move |inq: &Inq<Block>, _: &SyncArgs<()>| -> Result<(), StageError> {
        while let Some(b) = inq.pop() {
            sink_buf.lock().unwrap().extend_from_slice(b.as_slice());
        }
        Ok(())
    };

    let chain = Chain::builder()
        .source("udps-bh", 4, bottom, udps_bottom_half)
        .step("udps-th", 4, top, udps_top_half)
        .sink("collect", (), collect);
    let g = Arc::clone(&guard);
    chain.register_cancel(0, move || g.close()).unwrap();
    chain.run().unwrap();

    let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
    tx.connect(dest).unwrap();
    Receiver { chain, stats, collected, tx }
}

fn send(rx: &Receiver, seq: u64) {
    let payload = vec![(seq % 256) as u8; WR];
    send_seq_payload(rx.tx.as_raw_fd(), seq, &payload).unwrap();
}

fn wait_for_packets(rx: &Receiver, n: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while rx.stats.pkt_in.load(std::sync::atomic::Ordering::Relaxed) < n {
        assert!(Instant::now() < deadline, "receiver never saw {n} packets");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn slot(collected: &[u8], idx: usize) -> &[u8] {
    &collected[idx * WR..(idx + 1) * WR]
}

#[test]
fn in_order_stream_is_byte_exact() {
    let rx = start_receiver(2);
    for seq in 1000..1008u64 {
        send(&rx, seq);
    }
    wait_for_packets(&rx, 8);
    rx.chain.stop().unwrap();

    let got = rx.collected.lock().unwrap();
    assert_eq!(got.len(), 8 * WR);
    for i in 0..8 {
        let want = ((1000 + i as u64) % 256) as u8;
        assert!(slot(&got, i).iter().all(|&b| b == want), "slot {i}");
    }
    let (pkt_in, lost, ooo, disc, _) = rx.stats.snapshot();
    assert_eq!(pkt_in, 8);
    assert_eq!(lost, 0);
    assert_eq!(ooo, 0);
    assert_eq!(disc, 0);
}

#[test]
fn lost_datagram_becomes_fill_pattern() {
    // E3: [100, 101, 102, 104, 105] - 103 never sent
    let rx = start_receiver(2);
    for seq in [100u64, 101, 102, 104, 105] {
        send(&rx, seq);
    }
    wait_for_packets(&rx, 5);
    rx.chain.stop().unwrap();

    let got = rx.collected.lock().unwrap();
    assert_eq!(got.len(), 4 * WR + 2 * WR);
    assert!(slot(&got, 0).iter().all(|&b| b == 100));
    assert!(slot(&got, 1).iter().all(|&b| b == 101));
    assert!(slot(&got, 2).iter().all(|&b| b == 102));
    for chunk in slot(&got, 3).chunks(8) {
        assert_eq!(u64::from_le_bytes(chunk.try_into().unwrap()), FILL_PATTERN);
    }
    assert!(slot(&got, 4).iter().all(|&b| b == 104));

    let (_, lost, ooo, disc, _) = rx.stats.snapshot();
    assert_eq!(lost, 1);
    assert_eq!(ooo, 0);
    assert_eq!(disc, 0);
}

#[test]
fn late_arrival_within_readahead_is_reordered() {
    // [s, s+2, s+1]: the readahead covers it, output comes out in order
    let rx = start_receiver(2);
    for seq in [640u64, 642, 641] {
        send(&rx, seq);
        std::thread::sleep(Duration::from_millis(10));
    }
    wait_for_packets(&rx, 3);
    rx.chain.stop().unwrap();

    let got = rx.collected.lock().unwrap();
    assert_eq!(got.len(), 3 * WR);
    assert!(slot(&got, 0).iter().all(|&b| b == (640 % 256) as u8));
    assert!(slot(&got, 1).iter().all(|&b| b == (641 % 256) as u8));
    assert!(slot(&got, 2).iter().all(|&b| b == (642 % 256) as u8));

    let (_, lost, ooo, disc, _) = rx.stats.snapshot();
    assert_eq!(ooo, 1);
    assert_eq!(lost, 0);
    assert_eq!(disc, 0);
}

#[test]
fn arrival_behind_retired_block_is_discarded() {
    // seq 2000 anchors; 2008 forces block 0 out of the ring; a late 2000
    // then lands behind the window and is dropped on the floor
    let rx = start_receiver(2);
    send(&rx, 2000);
    std::thread::sleep(Duration::from_millis(20));
    send(&rx, 2008);
    std::thread::sleep(Duration::from_millis(20));
    send(&rx, 2000);
    wait_for_packets(&rx, 3);
    rx.chain.stop().unwrap();

    let got = rx.collected.lock().unwrap();
    // block 0 was retired with only slot 0 present
    assert!(slot(&got, 0).iter().all(|&b| b == (2000 % 256) as u8));
    for chunk in slot(&got, 1).chunks(8) {
        assert_eq!(u64::from_le_bytes(chunk.try_into().unwrap()), FILL_PATTERN);
    }

    let (_, _, _, disc, _) = rx.stats.snapshot();
    assert_eq!(disc, 1);
}

#[test]
fn resync_on_restarted_sequence_numbers() {
    // a sender restart drops the numbering to near zero: the reader must
    // re-anchor instead of discarding everything forever
    let rx = start_receiver(2);
    for seq in [50_000u64, 50_001] {
        send(&rx, seq);
    }
    wait_for_packets(&rx, 2);
    for seq in [7u64, 8, 9, 10] {
        send(&rx, seq);
    }
    // pkt_in restarted at 1 on the resync, so 4 covers the new numbering
    wait_for_packets(&rx, 4);
    rx.chain.stop().unwrap();

    let got = rx.collected.lock().unwrap();
    // after the resync the new numbering fills from its own block start
    assert!(got.len() >= 4 * WR);
    let tail = &got[got.len() - 4 * WR..];
    for (i, want) in [7u8, 8, 9, 10].iter().enumerate() {
        assert!(tail[i * WR..(i + 1) * WR].iter().all(|&b| b == *want), "slot {i}");
    }
}

#[test]
fn file_to_net_to_memory_replica() {
    // the E4 shape: a file pushed through the udps writer arrives
    // byte-identical at a udps reader
    use spool_net::{NetProtocol, net_client, open_file};
    use spool_stages::sinks::{NetWriteArgs, net_writer};
    use spool_stages::sources::{FdReadArgs, fd_reader};
    use std::io::Write;

    let rx = start_receiver(4);
    let dest = {
        // the receiver's tx socket is connected to the reader's port
        rx.tx.peer_addr().unwrap()
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let data: Vec<u8> = (0..8 * sizes().blocksize).map(|i| (i % 239) as u8).collect();
    std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

    let opened = open_file(&format!("{},r", path.display())).unwrap();
    let sock =
        net_client(NetProtocol::Udps, &dest.ip().to_string(), dest.port(), None, None).unwrap();

    let reader = FdReadArgs {
        fd: Arc::clone(&opened.guard),
        sizes: sizes(),
        counter: Arc::new(AtomicU64::new(0)),
    };
    let writer = NetWriteArgs {
        fd: Arc::clone(&sock.guard),
        proto: NetProtocol::Udps,
        needs_accept: false,
        sizes: sizes(),
        ipd_us: 100, // gentle pacing keeps loopback loss at zero
        theoretical_ipd_us: 0,
        counter: Arc::new(AtomicU64::new(0)),
    };
    let send_chain = Chain::builder()
        .source("file", 4, reader, fd_reader)
        .sink("net", writer, net_writer);
    send_chain.run().unwrap();
    send_chain.wait().unwrap();

    wait_for_packets(&rx, 8 * DGS_PER_BLOCK as u64);
    rx.chain.stop().unwrap();

    let got = rx.collected.lock().unwrap();
    assert_eq!(*got, data);
    let (_, lost, _, disc, _) = rx.stats.snapshot();
    assert_eq!(lost, 0);
    assert_eq!(disc, 0);
}
