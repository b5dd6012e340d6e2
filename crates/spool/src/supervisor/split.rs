use std::collections::HashMap;

use spool_blocks::Block;
use spool_chain::ChainBuilder;
use spool_net::NetProtocol;
use spool_stages::{
    Sizes,
    sinks::{MultiArgs, multi_writer},
    sources::{DiskArgs, FifoReadArgs, FillArgs},
    transforms::{
        FramerArgs, ReframeArgs, SplitArgs, coalescing_splitter, framer, lookup_splitter,
        reframe_to_vdif, tagger,
    },
};

use crate::{
    Reply, Runtime, SubMode, TransferMode,
    supervisor::{
        Rt, build,
        transfers::{ensure_idle, ensure_mode, install, parse_num, status, stop_transfer},
    },
};

/// The five split sources x two destinations: de-channelise a stream into
/// per-channel VDIF threads and scatter them over files or network peers.
/// Grammar: `connect : [file :] dest0[+dest1...] : splitter` with the file
/// argument only for the spif flavour.
pub(crate) fn split_family(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
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
            let header = match guard.header() {
                Ok(h) => h,
                Err(e) => return Reply::precondition(name, false, e),
            };
            let sizes = match guard.solve_sizes() {
                Ok(s) => s,
                Err(e) => return Reply::failed(name, false, e),
            };

            let spif = matches!(mode, TransferMode::Spif2Net | TransferMode::Spif2File);
            let (dest_idx, split_idx) = if spif { (2, 3) } else { (1, 2) };
            let Some(dest_arg) = args.get(dest_idx).copied().filter(|s| !s.is_empty()) else {
                return Reply::bad_arg(name, false, "missing destination list");
            };
            let Some(split_name) = args.get(split_idx).copied().filter(|s| !s.is_empty())
            else {
                return Reply::bad_arg(name, false, "missing splitter name");
            };
            let Some((split_fn, nchunk)) = lookup_splitter(split_name) else {
                return Reply::bad_arg(
                    name,
                    false,
                    format_args!("unknown splitter '{split_name}'"),
                );
            };
            if header.ntrack as usize % nchunk != 0 {
                return Reply::bad_arg(
                    name,
                    false,
                    format_args!("{} tracks will not split by {nchunk}", header.ntrack),
                );
            }
            let dests: Vec<String> = dest_arg.split('+').map(str::to_string).collect();

            // source per prefix
            let source = match mode {
                TransferMode::Spill2Net | TransferMode::Spill2File => {
                    Ok(build::fill_source(&mut guard, sizes, None, None, false))
                }
                TransferMode::Spid2Net | TransferMode::Spid2File => {
                    let len = guard.disk.length();
                    if guard.play.end == 0 {
                        guard.play.end = len;
                    }
                    Ok(build::disk_source(&mut guard, sizes))
                }
                TransferMode::Spin2Net | TransferMode::Spin2File => {
                    Ok(build::fifo_source(&mut guard, sizes))
                }
                TransferMode::Splet2Net | TransferMode::Splet2File => {
                    build::net_source(&mut guard, sizes)
                }
                _ => {
                    let Some(file) = args.get(1).copied() else {
                        return Reply::bad_arg(name, false, "missing file name");
                    };
                    build::file_source(&mut guard, sizes, file)
                }
            };
            let (builder, producer) = match source {
                Ok(s) => s,
                Err(e) => return Reply::failed(name, false, e),
            };

            let chain = split_tail(
                &mut guard,
                builder,
                sizes,
                header,
                split_fn,
                nchunk,
                &dests,
                mode,
            );
            let (chain, sink) = match chain {
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
            let Some(t) = &guard.transfer else {
                return Reply::precondition(name, false, "no chain installed");
            };
            // the run gate depends on what feeds the split
            let res = match mode {
                TransferMode::Spill2Net | TransferMode::Spill2File => {
                    let nword = args.get(1).and_then(|s| parse_num(s)).unwrap_or(u64::MAX);
                    t.chain.communicate::<FillArgs, _>(t.producer_step, move |a| {
                        a.nword = nword;
                        a.run = true;
                    })
                }
                TransferMode::Spid2Net | TransferMode::Spid2File => {
                    t.chain.communicate::<DiskArgs, _>(t.producer_step, |a| a.run = true)
                }
                TransferMode::Spin2Net | TransferMode::Spin2File => {
                    t.chain.communicate::<FifoReadArgs, _>(t.producer_step, |a| a.run = true)
                }
                // file and net sources free-run
                _ => Ok(()),
            };
            if let Err(e) = res {
                return Reply::failed(name, false, e);
            }
            guard.submode.remove(SubMode::WAIT);
            guard.submode.insert(SubMode::RUN);
            Reply::ok(name, false)
        }
        Some("off") | Some("disconnect") => stop_transfer(&mut guard, name),
        _ => Reply::bad_arg(name, false, "expected connect, on, off or disconnect"),
    }
}

/// The shared back half: framer, tagger, coalescing splitter, VDIF
/// reframer, multi-destination router.
#[allow(clippy::too_many_arguments)]
fn split_tail(
    rt: &mut Runtime,
    builder: ChainBuilder<Block>,
    sizes: Sizes,
    header: spool_format::HeaderSearch,
    split_fn: spool_stages::transforms::SplitFn,
    nchunk: usize,
    dests: &[String],
    mode: TransferMode,
) -> Result<(spool_chain::Chain, usize), String> {
    let fargs = FramerArgs {
        header,
        strict: false,
        ref_sec: now_unix(),
        counter: rt.counters.register("Framer"),
    };
    let sargs = SplitArgs {
        header,
        split: split_fn,
        nchunk,
        multiplier: nchunk as u32,
        counter: rt.counters.register(&format!("extract_{nchunk}ch")),
    };
    // station id: the first two VSN characters, the VDIF convention
    let vsn = rt.device.vsn();
    let sid = vsn.as_bytes();
    let station_id = match sid {
        [a, b, ..] => u16::from_le_bytes([*a, *b]),
        _ => 0,
    };
    let rargs = ReframeArgs {
        station_id,
        bitrate: rt.total_bps() / nchunk as u64,
        input_size: header.framesize,
        output_size: sizes.write_size.max(spool_format::VDIF_HEADER_SIZE + 8),
        bits_per_sample: 2,
        counter: rt.counters.register("Reframe/VDIF"),
    };

    let to_file = matches!(
        mode,
        TransferMode::Spill2File
            | TransferMode::Spid2File
            | TransferMode::Spif2File
            | TransferMode::Spin2File
            | TransferMode::Splet2File
    );
    let mut dest_by_tag = HashMap::new();
    for tag in 0..nchunk as u32 {
        let dest = &dests[tag as usize % dests.len()];
        let dest = if to_file && !dest.contains(',') {
            format!("{dest},w")
        } else {
            dest.clone()
        };
        dest_by_tag.insert(tag, dest);
    }
    let margs = MultiArgs {
        dest_by_tag,
        proto: if to_file { NetProtocol::Tcp } else { rt.netparms.protocol },
        lane_depth: 32,
        counter: rt.counters.register("MultiWrite"),
    };

    let b = builder
        .step("framer", 8, fargs, framer)
        .step("tagger", 8, 0u32, tagger)
        .step("split", 8, sargs, coalescing_splitter)
        .step("reframe", 8, rargs, reframe_to_vdif);
    let sink = b.last_step() + 1;
    Ok((b.sink("multi", margs, multi_writer), sink))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
