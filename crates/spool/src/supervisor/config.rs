use spool_format::TrackFormat;
use spool_net::NetProtocol;

use crate::{
    IoReg, Reply, TransferMode,
    supervisor::{Rt, transfers::parse_num},
    trackmask::TrackmaskStatus,
};

/// `mode = <format> : <maskhex|ntrack> [: trackbitrate]`. A hex mask sets
/// the track count to its population, the way the station software writes
/// it; a plain number is the track count itself.
pub(crate) fn mode_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mut guard = rt.lock().unwrap();
    if query {
        return Reply::ok(name, true)
            .with(guard.trackformat)
            .with(guard.ntrack)
            .with(guard.trackbitrate);
    }
    if !guard.mode.is_idle() {
        return Reply::precondition(name, false, "transfer in progress");
    }
    let Some(fmt_arg) = args.first().filter(|s| !s.is_empty()) else {
        return Reply::bad_arg(name, false, "missing data format");
    };
    let Ok(format) = fmt_arg.parse::<TrackFormat>() else {
        return Reply::bad_arg(name, false, format_args!("unknown format '{fmt_arg}'"));
    };
    let ntrack = match args.get(1).filter(|s| !s.is_empty()) {
        None => 32,
        Some(s) if s.starts_with("0x") || s.starts_with("0X") => match parse_num(s) {
            Some(mask) => {
                // channel bindings go to the sampler board as-is
                guard.board.write(IoReg::ChannelSelect, mask as u32);
                mask.count_ones()
            }
            None => return Reply::bad_arg(name, false, "bad track mask"),
        },
        Some(s) => match s.parse::<u32>() {
            Ok(n) => n,
            Err(_) => return Reply::bad_arg(name, false, "bad track count"),
        },
    };
    if let Some(bitrate) = args.get(2).and_then(|s| parse_num(s)) {
        guard.trackbitrate = bitrate;
    }
    guard.trackformat = format;
    guard.ntrack = ntrack;
    // a new mode invalidates any solved compression schedule
    guard.trackmask.clear();
    Reply::ok(name, false)
}

pub(crate) fn net_protocol_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mut guard = rt.lock().unwrap();
    if query {
        let np = &guard.netparms;
        return Reply::ok(name, true)
            .with(np.protocol)
            .with(np.sndbuf.unwrap_or(0))
            .with(np.rcvbuf.unwrap_or(0))
            .with(np.nblock);
    }
    let Some(proto_arg) = args.first().filter(|s| !s.is_empty()) else {
        return Reply::bad_arg(name, false, "missing protocol");
    };
    let Ok(protocol) = proto_arg.parse::<NetProtocol>() else {
        return Reply::bad_arg(name, false, format_args!("unknown protocol '{proto_arg}'"));
    };
    guard.netparms.protocol = protocol;
    if let Some(v) = args.get(1).and_then(|s| s.parse().ok()) {
        guard.netparms.sndbuf = Some(v);
    }
    if let Some(v) = args.get(2).and_then(|s| s.parse().ok()) {
        guard.netparms.rcvbuf = Some(v);
    }
    if let Some(v) = args.get(3).and_then(|s| s.parse().ok()) {
        guard.netparms.nblock = v;
    }
    Reply::ok(name, false)
}

pub(crate) fn mtu_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mut guard = rt.lock().unwrap();
    if query {
        return Reply::ok(name, true).with(guard.netparms.mtu);
    }
    match args.first().and_then(|s| s.parse::<usize>().ok()) {
        Some(mtu) if mtu >= 128 => {
            guard.netparms.mtu = mtu;
            Reply::ok(name, false)
        }
        _ => Reply::bad_arg(name, false, "mtu wants a number >= 128"),
    }
}

/// Inter-packet delay in microseconds; negative selects the theoretical
/// value. Reaches into a live sender immediately.
pub(crate) fn ipd_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mut guard = rt.lock().unwrap();
    if query {
        return Reply::ok(name, true).with(guard.netparms.ipd_us);
    }
    let Some(ipd) = args.first().and_then(|s| s.parse::<i64>().ok()) else {
        return Reply::bad_arg(name, false, "ipd wants an integer");
    };
    guard.netparms.ipd_us = ipd;
    if let Some(t) = &guard.transfer {
        use spool_stages::sinks::NetWriteArgs;
        let _ = t
            .chain
            .communicate::<NetWriteArgs, _>(t.sink_step, |a| a.ipd_us = ipd);
    }
    Reply::ok(name, false)
}

/// ACK back-traffic period; 0 suppresses it entirely.
pub(crate) fn ack_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mut guard = rt.lock().unwrap();
    if query {
        return Reply::ok(name, true).with(guard.netparms.ack_period);
    }
    match args.first().and_then(|s| s.parse::<u32>().ok()) {
        Some(period) => {
            guard.netparms.ack_period = period;
            Reply::ok(name, false)
        }
        None => Reply::bad_arg(name, false, "ack wants a count"),
    }
}

pub(crate) fn constraints_query(rt: &Rt, name: &str, query: bool, _args: &[&str]) -> Reply {
    let guard = rt.lock().unwrap();
    if !query {
        return Reply::bad_arg(name, false, "query only");
    }
    match guard.solve_sizes() {
        Ok(s) => Reply::ok(name, true)
            .with(guard.ntrack)
            .with(guard.trackformat)
            .with(guard.trackbitrate)
            .with(format_args!("bs {}", s.blocksize))
            .with(format_args!("rd {}", s.read_size))
            .with(format_args!("wr {}", s.write_size))
            .with(format_args!("co {}", s.compress_offset)),
        Err(e) => Reply::failed(name, true, e),
    }
}

pub(crate) fn tstat_cmd(rt: &Rt, name: &str, query: bool, _args: &[&str]) -> Reply {
    let guard = rt.lock().unwrap();
    let mut reply = Reply::ok(name, query);
    let fields = if query {
        guard.counters.rates(guard.mode, guard.fifo_fill())
    } else {
        guard.counters.raw(guard.mode)
    };
    for f in fields {
        reply = reply.with(f);
    }
    reply
}

pub(crate) fn evlbi_query(rt: &Rt, name: &str, query: bool, _args: &[&str]) -> Reply {
    let guard = rt.lock().unwrap();
    if !query {
        return Reply::bad_arg(name, false, "query only");
    }
    let (pkt_in, lost, ooo, disc, extent) = guard.packet_stats.snapshot();
    Reply::ok(name, true)
        .with(format_args!("total {pkt_in}"))
        .with(format_args!("lost {lost}"))
        .with(format_args!("ooo {ooo}"))
        .with(format_args!("disc {disc}"))
        .with(format_args!("extent {extent}"))
}

/// `trackmask = <hex mask> [: signmag]` starts the asynchronous solve
/// (reply 1); querying answers 5 while it runs, then 0 and the mask.
pub(crate) fn trackmask_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mut guard = rt.lock().unwrap();
    if query {
        return match guard.trackmask.poll() {
            TrackmaskStatus::Busy => Reply::busy(name, true),
            TrackmaskStatus::Ready { mask } => {
                Reply::ok(name, true).with(format_args!("{mask:#018x}"))
            }
            TrackmaskStatus::Idle => Reply::ok(name, true).with("none"),
            TrackmaskStatus::Failed(e) => Reply::failed(name, true, e),
        };
    }
    if !guard.mode.is_idle() {
        return Reply::precondition(name, false, "transfer in progress");
    }
    let Some(mask) = args.first().and_then(|s| parse_num(s)) else {
        return Reply::bad_arg(name, false, "trackmask wants a hex mask");
    };
    let signmag = args.get(1).and_then(|s| s.parse::<i32>().ok()).unwrap_or(0);
    guard.board.write(IoReg::TrackMask, mask as u32);
    guard.trackmask.start(mask, signmag);
    Reply::initiated(name, false)
}

pub(crate) fn protect_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let guard = rt.lock().unwrap();
    if query {
        return Reply::ok(name, true).with(if guard.device.protected() { "on" } else { "off" });
    }
    match args.first().copied() {
        Some("on") => {
            guard.device.set_protect(true);
            Reply::ok(name, false)
        }
        Some("off") => {
            guard.device.set_protect(false);
            Reply::ok(name, false)
        }
        _ => Reply::bad_arg(name, false, "expected on or off"),
    }
}

/// `reset = erase` wipes the recording; protect must have been switched
/// off first.
pub(crate) fn reset_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mut guard = rt.lock().unwrap();
    if query {
        return Reply::bad_arg(name, true, "command only");
    }
    match args.first().copied() {
        Some("erase") => {
            if !guard.mode.is_idle() {
                return Reply::precondition(name, false, "transfer in progress");
            }
            if guard.device.protected() {
                return Reply::precondition(name, false, "protect not off");
            }
            if let Err(e) = guard.device.erase() {
                return Reply::failed(name, false, e);
            }
            guard.play = crate::runtime::PlayRange::default();
            // protection re-arms after every destructive command
            guard.device.set_protect(true);
            Reply::ok(name, false)
        }
        _ => Reply::bad_arg(name, false, "expected erase"),
    }
}

/// Record length and play pointer.
pub(crate) fn position_query(rt: &Rt, name: &str, query: bool, _args: &[&str]) -> Reply {
    let guard = rt.lock().unwrap();
    if !query {
        return Reply::bad_arg(name, false, "query only");
    }
    Reply::ok(name, true).with(guard.disk.length()).with(guard.play.start)
}

/// Select the play range from the scan directory, by name or 1-based
/// index.
pub(crate) fn scan_set_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let mut guard = rt.lock().unwrap();
    let scans = guard.device.scans();
    if query {
        let current = scans
            .iter()
            .find(|s| s.start == guard.play.start)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "-".to_string());
        return Reply::ok(name, true)
            .with(current)
            .with(guard.play.start)
            .with(guard.play.end);
    }
    let Some(which) = args.first().filter(|s| !s.is_empty()) else {
        return Reply::bad_arg(name, false, "missing scan name or number");
    };
    let scan = match which.parse::<usize>() {
        Ok(n) if n >= 1 => scans.get(n - 1),
        _ => scans.iter().find(|s| s.name == *which),
    };
    match scan {
        Some(s) => {
            guard.play = crate::runtime::PlayRange {
                start: s.start,
                end: s.start + s.length,
            };
            Reply::ok(name, false).with(&s.name)
        }
        None => Reply::precondition(name, false, format_args!("no scan '{which}'")),
    }
}

pub(crate) fn vsn_cmd(rt: &Rt, name: &str, query: bool, args: &[&str]) -> Reply {
    let guard = rt.lock().unwrap();
    if query {
        return Reply::ok(name, true)
            .with(guard.device.vsn())
            .with(format_args!("{:?}", guard.device.record_state()));
    }
    match args.first().filter(|s| !s.is_empty()) {
        Some(vsn) if vsn.len() == 8 => {
            guard.device.set_vsn(vsn);
            Reply::ok(name, false)
        }
        Some(_) => Reply::bad_arg(name, false, "VSN must be 8 characters"),
        None => Reply::bad_arg(name, false, "missing VSN"),
    }
}

/// The transfer-mode overview: `status?` tells what the box is doing.
pub(crate) fn status_query(rt: &Rt, name: &str, query: bool, _args: &[&str]) -> Reply {
    let guard = rt.lock().unwrap();
    if !query {
        return Reply::bad_arg(name, false, "query only");
    }
    let mut r = Reply::ok(name, true).with(guard.mode);
    if guard.mode != TransferMode::NoTransfer {
        r = r.with(guard.submode);
    }
    r
}
