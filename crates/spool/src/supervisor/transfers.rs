use std::sync::Arc;

use spool_format::FILL_PATTERN;
use spool_stages::{
    sources::{DiskArgs, FifoReadArgs, FillArgs},
    transforms::{FramerArgs, TimeGrabArgs, timegrabber},
};
use tracing::{info, warn};

use crate::{
    IoReg, RecordState, Reply, Runtime, SubMode, TransferMode,
    runtime::ActiveTransfer,
    supervisor::{Rt, build},
};

pub(crate) fn parse_num(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn opt_num(args: &[&str], idx: usize) -> Option<u64> {
    args.get(idx).filter(|s| !s.is_empty()).and_then(|s| parse_num(s))
}

fn flag(args: &[&str], idx: usize) -> bool {
    matches!(opt_num(args, idx), Some(v) if v != 0)
}

/// The uniform query reply of every transfer command: status code 0, then
/// either "inactive" or the mode plus its submode flags.
pub(crate) fn status(rt: &Runtime, name: &str, mode: TransferMode) -> Reply {
    if rt.mode == mode {
        Reply::ok(name, true).with(mode).with(rt.submode)
    } else {
        Reply::ok(name, true).with("inactive")
    }
}

/// Reject a connect unless the runtime is idle (invariant: at most one
/// transfer, no reconfiguration of a live one).
pub(crate) fn ensure_idle(rt: &Runtime, name: &str) -> Result<(), Reply> {
    if rt.mode.is_idle() {
        Ok(())
    } else {
        Err(Reply::precondition(name, false, format_args!("already busy with {}", rt.mode)))
    }
}

pub(crate) fn ensure_mode(rt: &Runtime, name: &str, mode: TransferMode) -> Result<(), Reply> {
    if rt.mode == mode {
        Ok(())
    } else {
        Err(Reply::precondition(name, false, format_args!("not doing {mode}")))
    }
}

pub(crate) fn install(rt: &mut Runtime, mode: TransferMode, chain: spool_chain::Chain, producer: usize, sink: usize) {
    rt.transfer = Some(ActiveTransfer { chain, producer_step: producer, sink_step: sink });
    rt.mode = mode;
    rt.submode = SubMode::WAIT | SubMode::CONNECTED;
}

/// Tear the current chain down; failures become code 4 but the mode goes
/// back to idle no matter what, so the device is never wedged half-alive.
pub(crate) fn stop_transfer(rt: &mut Runtime, name: &str) -> Reply {
    let reply = match rt.transfer.take() {
        Some(t) => match t.chain.stop() {
            Ok(()) => Reply::ok(name, false),
            Err(e) => Reply::failed(name, false, e),
        },
        None => Reply::ok(name, false),
    };
    finish_bookkeeping(rt);
    // a mem reader consumes the interchain backlog; its queue is spent
    if matches!(
        rt.mode,
        TransferMode::Mem2Net
            | TransferMode::Mem2File
            | TransferMode::Mem2Sfxc
            | TransferMode::Mem2Time
    ) {
        rt.interchain = None;
    }
    rt.to_idle();
    reply
}

/// Device-side state updates owed at the end of a transfer.
fn finish_bookkeeping(rt: &mut Runtime) {
    if rt.mode.writes_disk() {
        rt.device.set_record_state(RecordState::Recorded);
    } else if rt.mode.reads_disk() && rt.mode != TransferMode::Condition {
        rt.device.set_record_state(RecordState::Played);
    }
}

/// Detached guard: waits for the chain to drain naturally, performs the
/// disk-state bookkeeping and returns the runtime to idle. The transfer's
/// own off/disconnect wins the race harmlessly - both paths end idle.
/// Takes the already-held runtime so it never re-locks under the caller.
fn spawn_guard(rt: &Rt, held: &Runtime, mode: TransferMode) {
    let Some(t) = &held.transfer else {
        return;
    };
    let chain = t.chain.clone();
    let rt = Arc::clone(rt);
    let _ = spool_utils::spawn_stage(&format!("guard-{mode}"), move || {
        if let Err(e) = chain.wait() {
            warn!(%e, %mode, "transfer ended with a failure");
        }
        let mut guard = rt.lock().unwrap();
        if guard.mode == mode {
            info!(%mode, "transfer ran to completion");
            finish_bookkeeping(&mut guard);
            guard.to_idle();
        }
    });
}

// ---- fill2file / fill2net / fill2out ----------------------------------

pub(crate) fn fill_family(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mode: TransferMode = name.parse().expect("registered transfer name");
    let mut guard = rt.lock().unwrap();
    if query {
        return status(&guard, name, mode);
    }
    match args.first().copied() {
        Some("connect") => {
            if let Err(r) = ensure_idle(&guard, name) {
                return r;
            }
            let sizes = match guard.solve_sizes() {
                Ok(s) => s,
                Err(e) => return Reply::failed(name, false, e),
            };
            // argument layout past "connect" differs per flavour
            let (dest, fill_at) = match mode {
                TransferMode::Fill2Out => (None, 1),
                _ => (args.get(1).copied(), 2),
            };
            let fill = opt_num(args, fill_at);
            let inc = opt_num(args, fill_at + 1);
            let realtime = flag(args, fill_at + 2);

            let (builder, producer) =
                build::fill_source(&mut guard, sizes, fill, inc, realtime);
            let built = match mode {
                TransferMode::Fill2File => {
                    let Some(file) = dest else {
                        return Reply::bad_arg(name, false, "missing file name");
                    };
                    build::file_sink(&mut guard, builder, file)
                }
                TransferMode::Fill2Net => {
                    let Some(host) = dest else {
                        return Reply::bad_arg(name, false, "missing host");
                    };
                    let b = build::maybe_compress(&mut guard, sizes, builder);
                    build::net_sink(&mut guard, b, sizes, host)
                }
                _ => Ok(build::fifo_sink(&mut guard, builder)),
            };
            let (chain, sink) = match built {
                Ok(c) => c,
                Err(e) => return Reply::failed(name, false, e),
            };
            if let Err(e) = chain.run() {
                return Reply::failed(name, false, e);
            }
            install(&mut guard, mode, chain, producer, sink);
            Reply::ok(name, false)
        }
        Some("on") => {
            if let Err(r) = ensure_mode(&guard, name, mode) {
                return r;
            }
            let nword = opt_num(args, 1).unwrap_or(u64::MAX);
            let Some(t) = &guard.transfer else {
                return Reply::precondition(name, false, "no chain installed");
            };
            let res = t.chain.communicate::<FillArgs, _>(t.producer_step, |a| {
                a.nword = nword;
                a.run = true;
            });
            if let Err(e) = res {
                return Reply::failed(name, false, e);
            }
            guard.submode.remove(SubMode::WAIT);
            guard.submode.insert(SubMode::RUN);
            // a bounded fill drains by itself; unbounded stops on command
            if nword != u64::MAX {
                spawn_guard(rt, &guard, mode);
            }
            Reply::ok(name, false)
        }
        Some("off") | Some("disconnect") => stop_transfer(&mut guard, name),
        _ => Reply::bad_arg(name, false, "expected connect, on, off or disconnect"),
    }
}

// ---- disk2net / file2net / disk2file / file2check / file2mem / disk2out

pub(crate) fn disk_family(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mode: TransferMode = name.parse().expect("registered transfer name");
    let mut guard = rt.lock().unwrap();
    if query {
        return status(&guard, name, mode);
    }
    match args.first().copied() {
        Some("connect") => {
            if let Err(r) = ensure_idle(&guard, name) {
                return r;
            }
            let sizes = match guard.solve_sizes() {
                Ok(s) => s,
                Err(e) => return Reply::failed(name, false, e),
            };
            if guard.play.end == 0 {
                let len = guard.disk.length();
                guard.play.end = len;
            }

            let from_disk = matches!(
                mode,
                TransferMode::Disk2Net | TransferMode::Disk2File | TransferMode::Disk2Out
            );
            let built = if from_disk {
                let (builder, producer) = build::disk_source(&mut guard, sizes);
                let tail = match mode {
                    TransferMode::Disk2Net => {
                        let Some(host) = args.get(1).copied() else {
                            return Reply::bad_arg(name, false, "missing host");
                        };
                        let b = build::maybe_compress(&mut guard, sizes, builder);
                        build::net_sink(&mut guard, b, sizes, host)
                    }
                    TransferMode::Disk2File => {
                        let Some(file) = args.get(1).copied() else {
                            return Reply::bad_arg(name, false, "missing file name");
                        };
                        build::file_sink(&mut guard, builder, file)
                    }
                    _ => Ok(build::fifo_sink(&mut guard, builder)),
                };
                tail.map(|(c, s)| (c, producer, s))
            } else {
                // file-fed flavours: file2net = connect : host : file
                let (file_arg, host_arg) = match mode {
                    TransferMode::File2Net => (args.get(2).copied(), args.get(1).copied()),
                    _ => (args.get(1).copied(), None),
                };
                let Some(file) = file_arg else {
                    return Reply::bad_arg(name, false, "missing file name");
                };
                match build::file_source(&mut guard, sizes, file) {
                    Err(e) => Err(e),
                    Ok((builder, producer)) => {
                        let tail = match mode {
                            TransferMode::File2Net => {
                                let Some(host) = host_arg else {
                                    return Reply::bad_arg(name, false, "missing host");
                                };
                                let b = build::maybe_compress(&mut guard, sizes, builder);
                                build::net_sink(&mut guard, b, sizes, host)
                            }
                            TransferMode::File2Check => {
                                Ok(build::check_sink(
                                    &mut guard,
                                    builder,
                                    opt_num(args, 2),
                                    opt_num(args, 3),
                                ))
                            }
                            TransferMode::File2Disk => Ok(build::disk_sink(&mut guard, builder)),
                            _ => Ok(build::mem_sink(&mut guard, builder)),
                        };
                        tail.map(|(c, s)| (c, producer, s))
                    }
                }
            };

            let (chain, producer, sink) = match built {
                Ok(c) => c,
                Err(e) => return Reply::failed(name, false, e),
            };
            if let Err(e) = chain.run() {
                return Reply::failed(name, false, e);
            }
            install(&mut guard, mode, chain, producer, sink);
            if !from_disk {
                // file readers free-run; the guard reaps them at EOF
                guard.submode.remove(SubMode::WAIT);
                guard.submode.insert(SubMode::RUN);
                spawn_guard(rt, &guard, mode);
            }
            Reply::ok(name, false)
        }
        Some("on") => {
            if let Err(r) = ensure_mode(&guard, name, mode) {
                return r;
            }
            let start = opt_num(args, 1).unwrap_or(guard.play.start);
            let end = match args.get(2).filter(|s| !s.is_empty()) {
                Some(e) if e.starts_with('+') => {
                    parse_num(&e[1..]).map(|n| start + n)
                }
                Some(e) => parse_num(e),
                None => Some(if guard.play.end > start { guard.play.end } else { guard.disk.length() }),
            };
            let Some(end) = end else {
                return Reply::bad_arg(name, false, "bad end pointer");
            };
            let repeat = flag(args, 3);
            if end > guard.disk.length() || start > end {
                return Reply::bad_arg(
                    name,
                    false,
                    format_args!("range {start}..{end} outside recording"),
                );
            }
            guard.play = crate::runtime::PlayRange { start, end };

            let Some(t) = &guard.transfer else {
                return Reply::precondition(name, false, "no chain installed");
            };
            let res = t.chain.communicate::<DiskArgs, _>(t.producer_step, |a| {
                a.pp_start = start;
                a.pp_end = end;
                a.repeat = repeat;
                a.run = true;
            });
            if let Err(e) = res {
                return Reply::failed(name, false, e);
            }
            guard.submode.remove(SubMode::WAIT);
            guard.submode.insert(SubMode::RUN);
            if !repeat {
                spawn_guard(rt, &guard, mode);
            }
            Reply::ok(name, false)
        }
        Some("off") | Some("disconnect") => stop_transfer(&mut guard, name),
        _ => Reply::bad_arg(name, false, "expected connect, on, off or disconnect"),
    }
}

// ---- net2out / net2disk / net2fork / net2file / net2check / net2sfxc /
//      net2sfxcfork / net2mem

pub(crate) fn net_family(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mode: TransferMode = name.parse().expect("registered transfer name");
    let mut guard = rt.lock().unwrap();
    if query {
        return status(&guard, name, mode);
    }
    match args.first().copied() {
        Some("connect") | Some("open") => {
            if let Err(r) = ensure_idle(&guard, name) {
                return r;
            }
            let sizes = match guard.solve_sizes() {
                Ok(s) => s,
                Err(e) => return Reply::failed(name, false, e),
            };
            let source = match build::net_source(&mut guard, sizes) {
                Ok(s) => s,
                Err(e) => return Reply::failed(name, false, e),
            };
            let (builder, producer) = source;
            let builder = build::maybe_decompress(&mut guard, sizes, builder);

            let scan_start = guard.disk.length();
            let built = match mode {
                TransferMode::Net2File => {
                    let Some(file) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing file name");
                    };
                    build::file_sink(&mut guard, builder, file)
                }
                TransferMode::Net2Disk => Ok(build::disk_sink(&mut guard, builder)),
                TransferMode::Net2Fork => {
                    let b = build::disk_tee(&mut guard, builder);
                    Ok(build::fifo_sink(&mut guard, b))
                }
                TransferMode::Net2Out => Ok(build::fifo_sink(&mut guard, builder)),
                TransferMode::Net2Check => Ok(build::check_sink(
                    &mut guard,
                    builder,
                    opt_num(args, 1),
                    opt_num(args, 2),
                )),
                TransferMode::Net2Sfxc => {
                    let Some(path) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing socket path");
                    };
                    build::sfxc_sink(&mut guard, builder, path)
                }
                TransferMode::Net2Sfxcfork => {
                    let Some(path) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing socket path");
                    };
                    let b = build::disk_tee(&mut guard, builder);
                    build::sfxc_sink(&mut guard, b, path)
                }
                _ => Ok(build::mem_sink(&mut guard, builder)),
            };
            let (chain, sink) = match built {
                Ok(c) => c,
                Err(e) => return Reply::failed(name, false, e),
            };
            if let Err(e) = chain.run() {
                return Reply::failed(name, false, e);
            }
            if mode == TransferMode::Net2Disk || mode == TransferMode::Net2Fork {
                let scan_name = args.get(1).copied().filter(|s| !s.is_empty()).unwrap_or("net-scan");
                guard.device.add_scan(scan_name, scan_start, 0);
            }
            install(&mut guard, mode, chain, producer, sink);
            guard.submode.remove(SubMode::WAIT);
            guard.submode.insert(SubMode::RUN);
            Reply::ok(name, false)
        }
        Some("close") | Some("disconnect") => stop_transfer(&mut guard, name),
        _ => Reply::bad_arg(name, false, "expected connect/open or close/disconnect"),
    }
}

// ---- in2net / in2disk / in2fork / in2file / in2mem / in2memfork -------

/// Default elasticity of the in2mem family's buffer stage.
const MEM_BUFFER_BYTES: u64 = 32 * 1024 * 1024;

pub(crate) fn in_family(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mode: TransferMode = name.parse().expect("registered transfer name");
    let mut guard = rt.lock().unwrap();
    if query {
        return status(&guard, name, mode);
    }
    match args.first().copied() {
        Some("connect") => {
            if let Err(r) = ensure_idle(&guard, name) {
                return r;
            }
            let sizes = match guard.solve_sizes() {
                Ok(s) => s,
                Err(e) => return Reply::failed(name, false, e),
            };
            let (builder, producer) = build::fifo_source(&mut guard, sizes);

            let built = match mode {
                TransferMode::In2Net => {
                    let Some(host) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing host");
                    };
                    let b = build::maybe_compress(&mut guard, sizes, builder);
                    build::net_sink(&mut guard, b, sizes, host)
                }
                TransferMode::In2Fork => {
                    let Some(host) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing host");
                    };
                    let b = build::disk_tee(&mut guard, builder);
                    let b = build::maybe_compress(&mut guard, sizes, b);
                    build::net_sink(&mut guard, b, sizes, host)
                }
                TransferMode::In2File => {
                    let Some(file) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing file name");
                    };
                    build::file_sink(&mut guard, builder, file)
                }
                TransferMode::In2Disk => Ok(build::disk_sink(&mut guard, builder)),
                TransferMode::In2Memfork => {
                    let b = build::disk_tee(&mut guard, builder);
                    let b = build::bufferer_step(&mut guard, b, MEM_BUFFER_BYTES);
                    Ok(build::mem_sink(&mut guard, b))
                }
                _ => {
                    let b = build::bufferer_step(&mut guard, builder, MEM_BUFFER_BYTES);
                    Ok(build::mem_sink(&mut guard, b))
                }
            };
            let (chain, sink) = match built {
                Ok(c) => c,
                Err(e) => return Reply::failed(name, false, e),
            };
            if let Err(e) = chain.run() {
                return Reply::failed(name, false, e);
            }
            if mode.writes_disk() {
                let scan_name =
                    args.get(2).copied().filter(|s| !s.is_empty()).unwrap_or("in-scan");
                let start = guard.disk.length();
                guard.device.add_scan(scan_name, start, 0);
            }
            install(&mut guard, mode, chain, producer, sink);
            Reply::ok(name, false)
        }
        Some("on") => {
            if let Err(r) = ensure_mode(&guard, name, mode) {
                return r;
            }
            let Some(t) = &guard.transfer else {
                return Reply::precondition(name, false, "no chain installed");
            };
            let res = t
                .chain
                .communicate::<FifoReadArgs, _>(t.producer_step, |a| a.run = true);
            if let Err(e) = res {
                return Reply::failed(name, false, e);
            }
            guard.board.write_field(IoReg::Gocom, 0, 1, 1);
            guard.submode.remove(SubMode::WAIT);
            guard.submode.insert(SubMode::RUN);
            Reply::ok(name, false)
        }
        Some("off") | Some("disconnect") => {
            guard.board.write_field(IoReg::Gocom, 0, 1, 0);
            stop_transfer(&mut guard, name)
        }
        _ => Reply::bad_arg(name, false, "expected connect, on, off or disconnect"),
    }
}

// ---- mem2net / mem2file / mem2sfxc / mem2time --------------------------

pub(crate) fn mem_family(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mode: TransferMode = name.parse().expect("registered transfer name");
    let mut guard = rt.lock().unwrap();
    if query {
        if mode == TransferMode::Mem2Time && guard.mode == mode {
            // the answer lives inside the grabber stage
            let Some(t) = &guard.transfer else {
                return Reply::precondition(name, true, "no chain installed");
            };
            let grabbed = t
                .chain
                .communicate::<TimeGrabArgs, _>(t.sink_step, |a| a.last);
            return match grabbed {
                Ok(Some(g)) => Reply::ok(name, true)
                    .with(g.os_sec)
                    .with(g.data.sec)
                    .with(g.data.ns),
                Ok(None) => Reply::ok(name, true).with("no frames yet"),
                Err(e) => Reply::failed(name, true, e),
            };
        }
        return status(&guard, name, mode);
    }
    match args.first().copied() {
        Some("connect") | Some("open") => {
            if let Err(r) = ensure_idle(&guard, name) {
                return r;
            }
            let sizes = match guard.solve_sizes() {
                Ok(s) => s,
                Err(e) => return Reply::failed(name, false, e),
            };
            let (builder, producer) = build::mem_source(&mut guard, sizes);

            let built = match mode {
                TransferMode::Mem2Net => {
                    let Some(host) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing host");
                    };
                    let b = build::maybe_compress(&mut guard, sizes, builder);
                    build::net_sink(&mut guard, b, sizes, host)
                }
                TransferMode::Mem2File => {
                    let Some(file) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing file name");
                    };
                    build::file_sink(&mut guard, builder, file)
                }
                TransferMode::Mem2Sfxc => {
                    let Some(path) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing socket path");
                    };
                    build::sfxc_sink(&mut guard, builder, path)
                }
                _ => {
                    // mem2time: frame the stream and keep the last timestamp
                    let header = match guard.header() {
                        Ok(h) => h,
                        Err(e) => return Reply::precondition(name, false, e),
                    };
                    let fargs = FramerArgs {
                        header,
                        strict: false,
                        ref_sec: now_unix(),
                        counter: guard.counters.register("Framer"),
                    };
                    let b = builder.step("framer", 8, fargs, spool_stages::transforms::framer);
                    let sink = b.last_step() + 1;
                    Ok((b.sink("timegrab", TimeGrabArgs::default(), timegrabber), sink))
                }
            };
            let (chain, sink) = match built {
                Ok(c) => c,
                Err(e) => return Reply::failed(name, false, e),
            };
            if let Err(e) = chain.run() {
                return Reply::failed(name, false, e);
            }
            install(&mut guard, mode, chain, producer, sink);
            guard.submode.remove(SubMode::WAIT);
            guard.submode.insert(SubMode::RUN);
            Reply::ok(name, false)
        }
        Some("off") | Some("disconnect") | Some("close") => stop_transfer(&mut guard, name),
        _ => Reply::bad_arg(name, false, "expected connect, close or disconnect"),
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---- condition ---------------------------------------------------------

/// Full-pack condition cycle: erase, stream a fill pattern through the
/// recording and read it back. Destructive, so protect must be off; runs
/// detached and reports 1 (initiated).
pub(crate) fn condition_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mut guard = rt.lock().unwrap();
    if query {
        return if guard.mode == TransferMode::Condition {
            Reply::ok(name, true).with("active")
        } else {
            Reply::ok(name, true).with("inactive")
        };
    }
    match args.first().copied() {
        Some("on") => {
            if let Err(r) = ensure_idle(&guard, name) {
                return r;
            }
            if guard.device.protected() {
                return Reply::precondition(name, false, "protect not off");
            }
            if let Err(e) = guard.device.erase() {
                return Reply::failed(name, false, e);
            }
            guard.mode = TransferMode::Condition;
            guard.submode = SubMode::RUN;

            let rt2 = Arc::clone(rt);
            let device = Arc::clone(&guard.device);
            let disk = Arc::clone(&guard.disk);
            let _ = spool_utils::spawn_stage("condition", move || {
                let mut block = vec![0u8; 1 << 20];
                spool_format::write_fill(&mut block, FILL_PATTERN);
                let passes = 16;
                for i in 0..passes {
                    if rt2.lock().unwrap().mode != TransferMode::Condition {
                        info!("condition aborted");
                        return;
                    }
                    if let Err(e) = device.append(&block) {
                        warn!(%e, pass = i, "condition write failed");
                        break;
                    }
                }
                let mut back = vec![0u8; 1 << 20];
                let mut bad = 0u64;
                for i in 0..passes {
                    if disk.read_at((i as u64) << 20, &mut back).is_err() {
                        bad += 1;
                        continue;
                    }
                    if back != block {
                        bad += 1;
                    }
                }
                let _ = device.erase();
                info!(bad, "condition cycle finished");
                let mut guard = rt2.lock().unwrap();
                if guard.mode == TransferMode::Condition {
                    guard.to_idle();
                }
            });
            Reply::initiated(name, false)
        }
        Some("off") => {
            if guard.mode == TransferMode::Condition {
                guard.to_idle();
            }
            Reply::ok(name, false)
        }
        _ => Reply::bad_arg(name, false, "expected on or off"),
    }
}
