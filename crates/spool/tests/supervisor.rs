//! Command-level scenarios: the seed tests of the protocol behaviour,
//! driven through the supervisor exactly as a control client would.

use std::{sync::Arc, time::Duration};

use spool::{BlockDevice, DeviceClass, RamPack, Runtime, Supervisor, TransferMode};

fn generic() -> (Supervisor, Arc<RamPack>) {
    let pack = Arc::new(RamPack::default());
    let sup = Supervisor::new(Runtime::new(DeviceClass::Generic, Arc::clone(&pack)));
    (sup, pack)
}

fn wait_idle(sup: &Supervisor) {
    let rt = sup.runtime();
    for _ in 0..500 {
        if rt.lock().unwrap().mode == TransferMode::NoTransfer {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("runtime never went idle");
}

#[test]
fn fill2file_produces_the_requested_words() {
    // E1: connect, on:128, disconnect -> 1024 bytes of fill pattern
    let (sup, _) = generic();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.bin");

    let r = sup.dispatch(&format!("fill2file=connect:{}", path.display()));
    assert_eq!(r.code, 0, "{r}");
    let r = sup.dispatch("fill2file=on:128");
    assert_eq!(r.code, 0, "{r}");
    wait_idle(&sup);
    let r = sup.dispatch("fill2file=disconnect");
    assert_eq!(r.code, 0, "{r}");

    let data = std::fs::read(&path).unwrap();
    assert_eq!(data.len(), 1024);
    for chunk in data.chunks(8) {
        assert_eq!(
            u64::from_le_bytes(chunk.try_into().unwrap()),
            0x1122_3344_1122_3344
        );
    }
}

#[test]
fn framed_fill2file_stamps_mark5b_headers() {
    // E2: mark5b mode, then fill2file produces real frames
    let (sup, _) = generic();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b.bin");

    assert_eq!(sup.dispatch("mode=mark5b:0xffffffff").code, 0);
    let r = sup.dispatch(&format!(
        "fill2file=connect:{}:0x1122334411223344:0:1",
        path.display()
    ));
    assert_eq!(r.code, 0, "{r}");
    assert_eq!(sup.dispatch("fill2file=on:20000").code, 0);
    wait_idle(&sup);
    sup.dispatch("fill2file=disconnect");

    let data = std::fs::read(&path).unwrap();
    assert_eq!(data.len(), 160_000);
    // frame 0: syncword + frame number 0
    assert_eq!(&data[0..4], &0xabad_deedu32.to_le_bytes());
    assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), 0);
    // frame 1 starts at 10016 with frame number 1
    assert_eq!(&data[10_016..10_020], &0xabad_deedu32.to_le_bytes());
    assert_eq!(u32::from_le_bytes(data[10_020..10_024].try_into().unwrap()), 1);
}

#[test]
fn transfer_exclusion_is_enforced() {
    // invariant 4: a second connect for a different mode fails with 6 and
    // leaves the running transfer alone
    let (sup, _) = generic();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x.bin");

    assert_eq!(
        sup.dispatch(&format!("fill2file=connect:{}", path.display())).code,
        0
    );
    let r = sup.dispatch("disk2net=connect:localhost");
    assert_eq!(r.code, 6, "{r}");
    assert_eq!(sup.runtime().lock().unwrap().mode, TransferMode::Fill2File);

    // a second connect of the same transfer is refused too
    let r = sup.dispatch(&format!("fill2file=connect:{}", path.display()));
    assert_eq!(r.code, 6, "{r}");

    assert_eq!(sup.dispatch("fill2file=disconnect").code, 0);
    assert_eq!(sup.runtime().lock().unwrap().mode, TransferMode::NoTransfer);
}

#[test]
fn trackmask_solve_is_asynchronous() {
    // E5 shape: the set returns 1, queries eventually settle on 0 + mask
    let (sup, _) = generic();
    let r = sup.dispatch("trackmask=0xf0f0f0f0f0f0f0f0:0");
    assert_eq!(r.code, 1, "{r}");

    let mut last = sup.dispatch("trackmask?");
    for _ in 0..100 {
        if last.code == 0 {
            break;
        }
        assert_eq!(last.code, 5, "{last}");
        std::thread::sleep(Duration::from_millis(5));
        last = sup.dispatch("trackmask?");
    }
    assert_eq!(last.code, 0, "{last}");
    assert!(last.fields[0].contains("f0f0f0f0f0f0f0f0"), "{last}");
}

#[test]
fn erase_needs_protect_off() {
    // E6: reset=erase refused while protected, allowed after protect=off
    let (sup, pack) = generic();
    pack.preload(&vec![0x42u8; 4096]);

    let r = sup.dispatch("reset=erase");
    assert_eq!(r.code, 6, "{r}");
    assert_eq!(sup.dispatch("protect=off").code, 0);
    assert_eq!(sup.dispatch("reset=erase").code, 0);

    let r = sup.dispatch("position?");
    assert_eq!(r.code, 0);
    assert_eq!(r.fields, vec!["0".to_string(), "0".to_string()]);
}

#[test]
fn disk2file_replays_the_selected_scan() {
    let (sup, pack) = generic();
    let recording: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    pack.preload(&recording);
    pack.add_scan("exp_st_scan1", 50_000, 100_000);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.bin");

    assert_eq!(sup.dispatch("scan_set=exp_st_scan1").code, 0);
    assert_eq!(
        sup.dispatch(&format!("disk2file=connect:{}", path.display())).code,
        0
    );
    assert_eq!(sup.dispatch("disk2file=on").code, 0);
    wait_idle(&sup);

    let data = std::fs::read(&path).unwrap();
    assert_eq!(data.len(), 100_000);
    assert_eq!(&data[..], &recording[50_000..150_000]);
}

#[test]
fn constraints_query_reports_the_solution() {
    let (sup, _) = generic();
    assert_eq!(sup.dispatch("mode=mark5b:0xffffffff:32000000").code, 0);
    assert_eq!(sup.dispatch("net_protocol=udps").code, 0);
    assert_eq!(sup.dispatch("mtu=9000").code, 0);

    let r = sup.dispatch("constraints?");
    assert_eq!(r.code, 0, "{r}");
    assert_eq!(r.fields[0], "32");
    assert_eq!(r.fields[1], "mark5b");
    assert_eq!(r.fields[2], "32000000");
    // a read chunk that divides the mark5b framesize
    let rd: usize = r.fields[4].strip_prefix("rd ").unwrap().parse().unwrap();
    assert_eq!(10_016 % rd, 0);
}

#[test]
fn tstat_shows_the_transfer_and_its_steps() {
    let (sup, _) = generic();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.bin");

    sup.dispatch(&format!("fill2file=connect:{}", path.display()));
    // no word count: the generator runs until told to stop
    sup.dispatch("fill2file=on");

    let r = sup.dispatch("tstat?");
    assert_eq!(r.code, 0);
    assert!(r.fields.iter().any(|f| f == "fill2file"), "{r}");
    assert!(r.fields.last().unwrap().starts_with("F "), "{r}");

    let raw = sup.dispatch("tstat=");
    assert!(raw.fields.iter().any(|f| f.starts_with("Fill")), "{raw}");

    assert_eq!(sup.dispatch("fill2file=disconnect").code, 0);
}

#[test]
fn condition_cycle_runs_detached_and_erases() {
    let (sup, pack) = generic();
    pack.preload(&vec![9u8; 1000]);

    // destructive, so gated on protect like the other erasing commands
    assert_eq!(sup.dispatch("condition=on").code, 6);
    assert_eq!(sup.dispatch("protect=off").code, 0);
    let r = sup.dispatch("condition=on");
    assert_eq!(r.code, 1, "{r}");
    assert_eq!(sup.dispatch("condition?").fields[0], "active");

    wait_idle(&sup);
    assert_eq!(sup.dispatch("condition?").fields[0], "inactive");
    // the cycle ends with an erased pack
    assert_eq!(sup.dispatch("position?").fields[0], "0");
}

#[test]
fn in2mem_buffers_for_a_later_mem2file() {
    use spool::FifoIo;

    let (sup, pack) = generic();
    // two blocks of sampler data sitting in the streaming fifo
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 241) as u8).collect();
    FifoIo::write(&*pack, &payload).unwrap();

    assert_eq!(sup.dispatch("in2mem=connect").code, 0);
    assert_eq!(sup.dispatch("in2mem=on").code, 0);
    // wait until the fifo has been moved into the interchain queue
    for _ in 0..500 {
        if pack.occupancy() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pack.occupancy(), 0);
    // let the tail of the chain settle into the boundary queue
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(sup.dispatch("in2mem=disconnect").code, 0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mem.bin");
    assert_eq!(sup.dispatch(&format!("mem2file=connect:{}", path.display())).code, 0);
    for _ in 0..500 {
        if std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) >= payload.len() as u64 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(sup.dispatch("mem2file=disconnect").code, 0);
    assert_eq!(std::fs::read(&path).unwrap(), payload);
}

#[test]
fn mode_query_reflects_settings() {
    let (sup, _) = generic();
    assert_eq!(sup.dispatch("mode=mark4:0xff").code, 0);
    let r = sup.dispatch("mode?");
    assert_eq!(r.fields, vec!["mark4".to_string(), "8".to_string(), "8000000".to_string()]);
}
