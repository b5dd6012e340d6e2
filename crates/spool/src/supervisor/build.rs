use std::sync::{Arc, atomic::AtomicU64};

use spool_blocks::Block;
use spool_chain::{Chain, ChainBuilder, Inq, Queue, StageError, StepId, SyncArgs};
use spool_net::{NetProtocol, net_client, net_server, open_file, open_unix_server};
use spool_stages::{
    Sizes,
    sinks::{
        CheckArgs, FdWriteArgs, FifoWriteArgs, NetWriteArgs, QueueWriteArgs, fd_writer,
        fifo_writer, fill_checker, net_writer, queue_writer, sfxc_writer,
    },
    sources::{
        DiskArgs, FdReadArgs, FifoReadArgs, FillArgs, NetReadArgs, QueueReadArgs, UdpsArgs,
        UdpsTopArgs, disk_reader, fd_reader, fifo_reader, fill_generator, net_reader,
        queue_reader, udps_bottom_half, udps_top_half,
    },
    transforms::{CompressArgs, block_compressor, block_decompressor},
};

use crate::{Runtime, constraints::theoretical_ipd_us};

/// Standard queue depth between stages; deep enough to ride out scheduler
/// hiccups, shallow enough to keep memory and latency bounded.
const QDEPTH: usize = 8;

/// `path` or `path,mode`: transfer arguments may omit the mode, the
/// open helper may not.
fn file_spec(arg: &str, default_mode: &str) -> String {
    if arg.contains(',') {
        arg.to_string()
    } else {
        format!("{arg},{default_mode}")
    }
}

/// host or host:port; the default port is the runtime's data port.
fn host_port(arg: &str, default_port: u16) -> (String, u16) {
    match arg.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            (host.to_string(), port.parse().unwrap())
        }
        _ => (arg.to_string(), default_port),
    }
}

// ---- sources ----------------------------------------------------------

pub(crate) fn fill_source(
    rt: &mut Runtime,
    sizes: Sizes,
    fill: Option<u64>,
    inc: Option<u64>,
    realtime: bool,
) -> (ChainBuilder<Block>, StepId) {
    let mut args = FillArgs::new(sizes, rt.counters.register("Fill"));
    if let Some(f) = fill {
        args.fill = f;
    }
    if let Some(i) = inc {
        args.inc = i;
    }
    args.realtime = realtime;
    args.header = rt.header().ok();

    let b = Chain::builder().source("fill", QDEPTH, args, fill_generator);
    let step = b.last_step();
    (b, step)
}

pub(crate) fn disk_source(rt: &mut Runtime, sizes: Sizes) -> (ChainBuilder<Block>, StepId) {
    let args = DiskArgs {
        run: false,
        pp_start: rt.play.start,
        pp_end: rt.play.end,
        repeat: false,
        dev: Arc::clone(&rt.disk),
        sizes,
        counter: rt.counters.register("Disk"),
    };
    let b = Chain::builder().source("disk", QDEPTH, args, disk_reader);
    let step = b.last_step();
    (b, step)
}

pub(crate) fn file_source(
    rt: &mut Runtime,
    sizes: Sizes,
    arg: &str,
) -> Result<(ChainBuilder<Block>, StepId), String> {
    let opened = open_file(&file_spec(arg, "r")).map_err(|e| e.to_string())?;
    let guard = Arc::clone(&opened.guard);
    let args = FdReadArgs {
        fd: opened.guard,
        sizes,
        counter: rt.counters.register("FileRead"),
    };
    let mut b = Chain::builder().source("file", QDEPTH, args, fd_reader);
    let step = b.last_step();
    b.register_cancel(step, move || guard.close());
    Ok((b, step))
}

pub(crate) fn fifo_source(rt: &mut Runtime, sizes: Sizes) -> (ChainBuilder<Block>, StepId) {
    let args = FifoReadArgs {
        run: false,
        fifo: Arc::clone(&rt.fifo),
        sizes,
        counter: rt.counters.register("Fifo"),
        discarded: Arc::new(AtomicU64::new(0)),
        hiwater_fraction: 0.5,
    };
    let b = Chain::builder().source("fifo", QDEPTH, args, fifo_reader);
    let step = b.last_step();
    (b, step)
}

/// Network source per the configured protocol: the sequenced reader is its
/// two-half pipeline, everything else one stage.
pub(crate) fn net_source(
    rt: &mut Runtime,
    sizes: Sizes,
) -> Result<(ChainBuilder<Block>, StepId), String> {
    let np = &rt.netparms;
    let sock = net_server(np.protocol, "", np.port, np.sndbuf, np.rcvbuf)
        .map_err(|e| e.to_string())?;
    let guard = Arc::clone(&sock.guard);

    let b = if np.protocol == NetProtocol::Udps {
        let bottom = UdpsArgs {
            fd: Arc::clone(&sock.guard),
            sizes,
            readahead: np.nblock,
            ack_period: np.ack_period,
            allow_variable_block_size: np.allow_variable_block_size,
            stats: Arc::clone(&rt.packet_stats),
            counter: rt.counters.register("NetRead/UDPs"),
        };
        let top = UdpsTopArgs {
            sizes,
            expect_vdif: rt.trackformat.is_vdif(),
            counter: rt.counters.register("FillPatcher"),
        };
        let mut b = Chain::builder().source("udps-bh", QDEPTH, bottom, udps_bottom_half);
        b.register_cancel(0, move || guard.close());
        b.step("udps-th", QDEPTH, top, udps_top_half)
    } else {
        let args = NetReadArgs {
            fd: Arc::clone(&sock.guard),
            proto: np.protocol,
            needs_accept: sock.needs_accept,
            sizes,
            counter: rt.counters.register("NetRead"),
        };
        let mut b = Chain::builder().source("net", QDEPTH, args, net_reader);
        b.register_cancel(0, move || guard.close());
        b
    };
    let step = 0;
    Ok((b, step))
}

/// Reader on the interchain boundary queue, creating the queue if this is
/// the first of the pair to show up. The cancel thunk delayed-disables the
/// queue: the reader drains whatever is buffered and exits, instead of
/// sitting in a pop nobody will ever satisfy.
pub(crate) fn mem_source(rt: &mut Runtime, sizes: Sizes) -> (ChainBuilder<Block>, StepId) {
    let interchain = rt
        .interchain
        .get_or_insert_with(|| Queue::new(64))
        .clone();
    let cancel_q = interchain.clone();
    let args = QueueReadArgs {
        interchain,
        sizes,
        counter: rt.counters.register("MemRead"),
    };
    let mut b = Chain::builder().source("mem", QDEPTH, args, queue_reader);
    let step = b.last_step();
    b.register_cancel(step, move || cancel_q.delayed_disable());
    (b, step)
}

// ---- optional transforms ----------------------------------------------

/// Insert the block compressor when a trackmask solution is installed.
pub(crate) fn maybe_compress(
    rt: &mut Runtime,
    sizes: Sizes,
    b: ChainBuilder<Block>,
) -> ChainBuilder<Block> {
    match rt.trackmask.codec() {
        Some(codec) => b.step(
            "compress",
            QDEPTH,
            CompressArgs { codec, sizes, counter: rt.counters.register("Compress") },
            block_compressor,
        ),
        None => b,
    }
}

/// Inverse on the receiving side.
pub(crate) fn maybe_decompress(
    rt: &mut Runtime,
    sizes: Sizes,
    b: ChainBuilder<Block>,
) -> ChainBuilder<Block> {
    match rt.trackmask.codec() {
        Some(codec) => b.step(
            "decompress",
            QDEPTH,
            CompressArgs { codec, sizes, counter: rt.counters.register("Decompress") },
            block_decompressor,
        ),
        None => b,
    }
}

/// Elasticity buffer in front of the boundary queue; the budget stays
/// reachable through the side channel for the buffer-size commands.
pub(crate) fn bufferer_step(
    rt: &mut Runtime,
    b: ChainBuilder<Block>,
    bytes_to_buffer: u64,
) -> ChainBuilder<Block> {
    let args = spool_stages::transforms::BuffererArgs {
        bytes_to_buffer,
        counter: rt.counters.register("Bufferer"),
    };
    b.step("bufferer", QDEPTH, args, spool_stages::transforms::bufferer)
}

/// Record-path tee: append every block to the pack and pass it on (the
/// "fork" of in2fork/net2fork).
pub(crate) fn disk_tee(rt: &mut Runtime, b: ChainBuilder<Block>) -> ChainBuilder<Block> {
    let device = Arc::clone(&rt.device);
    let counter = rt.counters.register("ForkDisk");
    b.step("fork-disk", QDEPTH, (), move |inq, out, _sync: &SyncArgs<()>| {
        while let Some(blk) = inq.pop() {
            device
                .append(blk.as_slice())
                .map_err(|e| StageError::msg(format!("append: {e}")))?;
            counter.fetch_add(blk.len() as u64, std::sync::atomic::Ordering::Relaxed);
            if !out.push(blk) {
                break;
            }
        }
        Ok(())
    })
}

// ---- sinks ------------------------------------------------------------

pub(crate) fn file_sink(
    rt: &mut Runtime,
    b: ChainBuilder<Block>,
    arg: &str,
) -> Result<(Chain, StepId), String> {
    let opened = open_file(&file_spec(arg, "w")).map_err(|e| e.to_string())?;
    let guard = Arc::clone(&opened.guard);
    let args = FdWriteArgs { fd: opened.guard, counter: rt.counters.register("FileWrite") };
    let step = b.last_step() + 1;
    let chain = b.sink("file-out", args, fd_writer);
    chain.register_cancel(step, move || guard.close()).map_err(|e| e.to_string())?;
    rt.last_file = arg.to_string();
    Ok((chain, step))
}

pub(crate) fn net_sink(
    rt: &mut Runtime,
    b: ChainBuilder<Block>,
    sizes: Sizes,
    host_arg: &str,
) -> Result<(Chain, StepId), String> {
    let np = &rt.netparms;
    let (host, port) = host_port(host_arg, np.port);
    let sock = net_client(np.protocol, &host, port, np.sndbuf, np.rcvbuf)
        .map_err(|e| e.to_string())?;
    let guard = Arc::clone(&sock.guard);

    let args = NetWriteArgs {
        fd: sock.guard,
        proto: np.protocol,
        needs_accept: sock.needs_accept,
        sizes,
        ipd_us: np.ipd_us,
        theoretical_ipd_us: theoretical_ipd_us(
            rt.total_bps(),
            sizes.write_size,
            rt.trackmask.compression_factor(),
        ),
        counter: rt.counters.register("NetWrite"),
    };
    let step = b.last_step() + 1;
    let chain = b.sink("net-out", args, net_writer);
    chain.register_cancel(step, move || guard.close()).map_err(|e| e.to_string())?;
    rt.last_host = host;
    Ok((chain, step))
}

pub(crate) fn fifo_sink(rt: &mut Runtime, b: ChainBuilder<Block>) -> (Chain, StepId) {
    let args = FifoWriteArgs {
        fifo: Arc::clone(&rt.fifo),
        hiwater_fraction: 0.6,
        skipped: Arc::new(AtomicU64::new(0)),
        counter: rt.counters.register("FifoWrite"),
    };
    let step = b.last_step() + 1;
    (b.sink("fifo-out", args, fifo_writer), step)
}

/// Record onto the pack through the streaming append.
pub(crate) fn disk_sink(rt: &mut Runtime, b: ChainBuilder<Block>) -> (Chain, StepId) {
    let device = Arc::clone(&rt.device);
    let counter = rt.counters.register("DiskWrite");
    let step = b.last_step() + 1;
    let chain = b.sink("disk-out", (), move |inq: &Inq<Block>, _sync: &SyncArgs<()>| {
        while let Some(blk) = inq.pop() {
            device
                .append(blk.as_slice())
                .map_err(|e| StageError::msg(format!("append: {e}")))?;
            counter.fetch_add(blk.len() as u64, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(())
    });
    (chain, step)
}

/// The writer itself marks the queue no-more-producers once its input
/// drains; the backlog stays poppable for whichever mem reader shows up
/// later.
pub(crate) fn mem_sink(rt: &mut Runtime, b: ChainBuilder<Block>) -> (Chain, StepId) {
    let interchain = rt
        .interchain
        .get_or_insert_with(|| Queue::new(64))
        .clone();
    let args = QueueWriteArgs { interchain, counter: rt.counters.register("MemWrite") };
    let step = b.last_step() + 1;
    (b.sink("mem-out", args, queue_writer), step)
}

pub(crate) fn check_sink(
    rt: &mut Runtime,
    b: ChainBuilder<Block>,
    fill: Option<u64>,
    inc: Option<u64>,
) -> (Chain, StepId) {
    let args = CheckArgs {
        fill: fill.unwrap_or(spool_format::FILL_PATTERN),
        inc: inc.unwrap_or(0),
        mismatches: Arc::new(AtomicU64::new(0)),
        counter: rt.counters.register("Check"),
    };
    let step = b.last_step() + 1;
    (b.sink("check", args, fill_checker), step)
}

pub(crate) fn sfxc_sink(
    rt: &mut Runtime,
    b: ChainBuilder<Block>,
    path: &str,
) -> Result<(Chain, StepId), String> {
    let guard = open_unix_server(path).map_err(|e| e.to_string())?;
    let cancel = Arc::clone(&guard);
    let args = FdWriteArgs { fd: guard, counter: rt.counters.register("SfxcWrite") };
    let step = b.last_step() + 1;
    let chain = b.sink("sfxc", args, sfxc_writer);
    chain.register_cancel(step, move || cancel.close()).map_err(|e| e.to_string())?;
    Ok((chain, step))
}
