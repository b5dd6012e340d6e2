//! The recorder control daemon: a line-oriented command channel in front
//! of one [`Supervisor`]. Station software connects, sends `;`-separated
//! statements, reads `!name= code ;` replies back.

use std::{
    io::{BufRead, BufReader, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
};

use clap::Parser;
use spool::{DeviceClass, RamPack, Runtime, Supervisor};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "spoold", about = "VLBI recorder control daemon")]
struct Opts {
    /// command port to listen on
    #[arg(short, long, default_value_t = 2620)]
    port: u16,

    /// device personality: mk5a, mk5bdim, mk5bdom or generic
    #[arg(short, long, default_value = "generic")]
    class: DeviceClass,

    /// modelled streaming-fifo capacity in MiB
    #[arg(long, default_value_t = 512)]
    fifo_mib: u64,
}

fn main() {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let device = Arc::new(RamPack::new(opts.fifo_mib * 1024 * 1024));
    let supervisor = Arc::new(Supervisor::new(Runtime::new(opts.class, device)));

    let listener = match TcpListener::bind(("0.0.0.0", opts.port)) {
        Ok(l) => l,
        Err(e) => {
            error!(port = opts.port, %e, "cannot bind command port");
            std::process::exit(1);
        }
    };
    info!(port = opts.port, class = %opts.class, "command channel up");

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let sup = Arc::clone(&supervisor);
                let _ = std::thread::Builder::new()
                    .name("command-conn".into())
                    .spawn(move || serve(stream, &sup));
            }
            Err(e) => warn!(%e, "accept on command port"),
        }
    }
}

fn serve(stream: TcpStream, supervisor: &Supervisor) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    info!(%peer, "control connection");
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!(%e, "cloning control stream");
            return;
        }
    };
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = supervisor.process_line(&line);
        if writer.write_all(reply.as_bytes()).is_err()
            || writer.write_all(b"\r\n").is_err()
        {
            break;
        }
    }
    info!(%peer, "control connection closed");
}
