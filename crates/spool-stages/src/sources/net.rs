use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Outq, StageError, SyncArgs};
use spool_net::{FdGuard, NetProtocol, accept_incoming, is_cancelled, recv_into};
use tracing::{debug, info};

use crate::{Sizes, fdio::read_full};

pub struct NetReadArgs {
    pub fd: Arc<FdGuard>,
    pub proto: NetProtocol,
    /// listener that still has to accept the data connection
    pub needs_accept: bool,
    pub sizes: Sizes,
    pub counter: Arc<AtomicU64>,
}

/// Protocol-dispatching network source for everything that is not udps:
/// accepts if the socket is a listener, then runs the stream or datagram
/// loop. (The sequenced-udp reader is its own two-stage pipeline.)
pub fn net_reader(out: &Outq<Block>, sync: &SyncArgs<NetReadArgs>) -> Result<(), StageError> {
    let (fd, proto, needs_accept) =
        sync.with(|a| (Arc::clone(&a.fd), a.proto, a.needs_accept));

    if needs_accept {
        info!(fd = fd.fd(), "waiting for incoming data connection");
        match accept_incoming(fd.fd()) {
            Ok((conn, peer)) => {
                if sync.cancelled() {
                    unsafe { libc::close(conn) };
                    return Ok(());
                }
                info!(%peer, "incoming data connection");
                fd.replace(conn);
            }
            Err(e) if is_cancelled(&e) => return Ok(()),
            Err(e) => return Err(StageError::msg(format!("accept: {e}"))),
        }
    }

    match proto {
        NetProtocol::Udp => udp_reader(out, sync),
        _ => socket_reader(out, sync),
    }
}

/// Stream-protocol reader (tcp, unix, rtcp): read exactly `write_size`
/// bytes per inner iteration into successive positions of the block, push
/// when full.
pub fn socket_reader(out: &Outq<Block>, sync: &SyncArgs<NetReadArgs>) -> Result<(), StageError> {
    let (fd, sizes, counter) =
        sync.with(|a| (Arc::clone(&a.fd), a.sizes, Arc::clone(&a.counter)));
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;
    let pool = Blockpool::new(sizes.blocksize, 16);
    let wr = sizes.write_size;

    info!(fd = fd.fd(), write_size = wr, "socket reader starting");
    'outer: loop {
        let mut b = pool.get();
        let mut filled = 0usize;
        while filled < sizes.blocksize {
            if sync.cancelled() || fd.is_closed() {
                break 'outer;
            }
            let want = wr.min(sizes.blocksize - filled);
            let got = match read_full(fd.fd(), &mut b.as_mut_slice()[filled..filled + want]) {
                Ok(n) => n,
                Err(e) if is_cancelled(&e) => break 'outer,
                Err(e) => return Err(StageError::msg(format!("recv: {e}"))),
            };
            if got == 0 {
                // connection closed; forward what we have
                if filled > 0 && out.push(b.sub(0, filled)) {
                    counter.fetch_add(filled as u64, Ordering::Relaxed);
                }
                break 'outer;
            }
            filled += got;
        }
        if filled == sizes.blocksize {
            if !out.push(b) {
                break;
            }
            counter.fetch_add(filled as u64, Ordering::Relaxed);
        }
    }
    debug!("socket reader stopping");
    Ok(())
}

/// Unsequenced datagram reader: one datagram of up to `write_size` bytes
/// per slot, no recovery of anything.
pub fn udp_reader(out: &Outq<Block>, sync: &SyncArgs<NetReadArgs>) -> Result<(), StageError> {
    let (fd, sizes, counter) =
        sync.with(|a| (Arc::clone(&a.fd), a.sizes, Arc::clone(&a.counter)));
    sizes.validate().map_err(|e| StageError::msg(e.to_string()))?;
    let pool = Blockpool::new(sizes.blocksize, 16);
    let wr = sizes.write_size;

    info!(fd = fd.fd(), write_size = wr, "udp reader starting");
    'outer: loop {
        let mut b = pool.get();
        let mut filled = 0usize;
        while filled + wr <= sizes.blocksize {
            if sync.cancelled() || fd.is_closed() {
                break 'outer;
            }
            match recv_into(fd.fd(), &mut b.as_mut_slice()[filled..filled + wr]) {
                Ok(0) => break 'outer,
                Ok(n) => filled += n.min(wr),
                Err(e) if is_cancelled(&e) => break 'outer,
                Err(e) => return Err(StageError::msg(format!("recv: {e}"))),
            }
        }
        if filled > 0 {
            let blk = if filled == sizes.blocksize { b } else { b.sub(0, filled) };
            if !out.push(blk) {
                break;
            }
            counter.fetch_add(filled as u64, Ordering::Relaxed);
        }
    }
    debug!("udp reader stopping");
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{
        io::Write,
        net::{TcpStream, UdpSocket},
        os::fd::IntoRawFd,
    };

    use spool_chain::Chain;
    use spool_net::{net_client, net_server};

    use super::*;

    fn collect_sink() -> (
        Arc<std::sync::Mutex<Vec<u8>>>,
        impl FnOnce(&spool_chain::Inq<Block>, &SyncArgs<()>) -> Result<(), StageError> + Send + 'static,
    ) {
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        (collected, move |inq: &spool_chain::Inq<Block>, _: &SyncArgs<()>| {
            while let Some(b) = inq.pop() {
                sink.lock().unwrap().extend_from_slice(b.as_slice());
            }
            Ok(())
        })
    }

    #[test]
    fn tcp_accept_then_stream_blocks() {
        let server = net_server(NetProtocol::Tcp, "127.0.0.1", 0, None, None).unwrap();
        // find the bound port
        let port = {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            unsafe {
                libc::getsockname(
                    server.guard.fd(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            u16::from_be(sin.sin_port)
        };

        let (collected, sink) = collect_sink();
        let args = NetReadArgs {
            fd: Arc::clone(&server.guard),
            proto: NetProtocol::Tcp,
            needs_accept: server.needs_accept,
            sizes: Sizes::plain(512),
            counter: Arc::new(AtomicU64::new(0)),
        };
        let chain = Chain::builder().source("net", 4, args, net_reader).sink("collect", (), sink);
        chain.run().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        client.write_all(&data).unwrap();
        drop(client);

        chain.wait().unwrap();
        assert_eq!(*collected.lock().unwrap(), data);
    }

    #[test]
    fn udp_reader_packs_datagrams_into_blocks() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = rx.local_addr().unwrap();
        let guard = Arc::new(FdGuard::new(rx.into_raw_fd()));

        let sizes = Sizes {
            blocksize: 4 * 64,
            read_size: 64,
            write_size: 64,
            compress_offset: 0,
            framesize: None,
            n_mtu: None,
        };
        let (collected, sink) = collect_sink();
        let args = NetReadArgs {
            fd: Arc::clone(&guard),
            proto: NetProtocol::Udp,
            needs_accept: false,
            sizes,
            counter: Arc::new(AtomicU64::new(0)),
        };
        let chain = Chain::builder().source("udp", 4, args, net_reader).sink("collect", (), sink);
        let g = Arc::clone(&guard);
        chain.register_cancel(0, move || g.close()).unwrap();
        chain.run().unwrap();

        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..4u8 {
            tx.send_to(&[i; 64], dest).unwrap();
        }
        // one full block = 4 datagrams
        while collected.lock().unwrap().len() < 256 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        chain.stop().unwrap();

        let got = collected.lock().unwrap();
        for i in 0..4usize {
            assert!(got[i * 64..(i + 1) * 64].iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn rtcp_client_listens_for_receiver() {
        // "client" side of an rtcp transfer listens; plain tcp dials it
        let sock = net_client(NetProtocol::Rtcp, "", 0, None, None).unwrap();
        assert!(sock.needs_accept);
    }
}
