use std::sync::{Arc, atomic::AtomicU64};

use spool_blocks::Block;
use spool_chain::{Inq, StageError, SyncArgs};
use spool_net::{FdGuard, NetProtocol, accept_incoming, is_cancelled};
use tracing::info;

use crate::Sizes;
use crate::sinks::fd::{FdWriteArgs, fd_writer};
use crate::sinks::udp::{udp_writer, udps_writer, vtp_writer};

pub struct NetWriteArgs {
    pub fd: Arc<FdGuard>,
    pub proto: NetProtocol,
    /// rtcp: we are the listener and the receiver dials us
    pub needs_accept: bool,
    pub sizes: Sizes,
    /// configured inter-packet delay in microseconds; negative selects the
    /// theoretical value
    pub ipd_us: i64,
    /// derived from trackbitrate x ntrack x compression over the mtu
    pub theoretical_ipd_us: u64,
    pub counter: Arc<AtomicU64>,
}

/// The sending end of every *2net transfer: accept the reverse connection
/// if the protocol calls for it, then hand the stream to the writer
/// matching the protocol.
pub fn net_writer(inq: &Inq<Block>, sync: &SyncArgs<NetWriteArgs>) -> Result<(), StageError> {
    let (fd, proto, needs_accept) =
        sync.with(|a| (Arc::clone(&a.fd), a.proto, a.needs_accept));

    if needs_accept {
        info!(fd = fd.fd(), "waiting for the receiver to connect");
        match accept_incoming(fd.fd()) {
            Ok((conn, peer)) => {
                if sync.cancelled() {
                    unsafe { libc::close(conn) };
                    return Ok(());
                }
                info!(%peer, "receiver connected");
                fd.replace(conn);
            }
            Err(e) if is_cancelled(&e) => return Ok(()),
            Err(e) => return Err(StageError::msg(format!("accept: {e}"))),
        }
    }

    match proto {
        NetProtocol::Udps => udps_writer(inq, sync),
        NetProtocol::Vtp => vtp_writer(inq, sync),
        NetProtocol::Udp => udp_writer(inq, sync),
        _ => {
            // stream protocols: the plain fd writer does it all
            let args = sync.with(|a| FdWriteArgs {
                fd: Arc::clone(&a.fd),
                counter: Arc::clone(&a.counter),
            });
            let plain = SyncArgs::new(args);
            fd_writer(inq, &plain)
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::UdpSocket;
    use std::os::fd::IntoRawFd;
    use std::sync::atomic::Ordering;

    use spool_blocks::Blockpool;
    use spool_chain::Chain;
    use spool_net::{net_client, recv_seq_payload};

    use super::*;

    #[test]
    fn udps_path_chunks_and_sequences() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = rx.local_addr().unwrap().port();
        let sock = net_client(NetProtocol::Udps, "127.0.0.1", port, None, None).unwrap();

        let sizes = Sizes {
            blocksize: 4 * 256,
            read_size: 256,
            write_size: 256,
            compress_offset: 0,
            framesize: None,
            n_mtu: Some(4),
        };
        let counter = Arc::new(AtomicU64::new(0));
        let args = NetWriteArgs {
            fd: Arc::clone(&sock.guard),
            proto: NetProtocol::Udps,
            needs_accept: false,
            sizes,
            ipd_us: 0,
            theoretical_ipd_us: 0,
            counter: Arc::clone(&counter),
        };
        let pool = Blockpool::new(sizes.blocksize, 2);
        let chain = Chain::builder()
            .source("feed", 2, pool, |out, sync| {
                sync.with(|pool| {
                    let mut b = pool.get();
                    for (i, x) in b.as_mut_slice().iter_mut().enumerate() {
                        *x = (i / 256) as u8;
                    }
                    out.push(b);
                });
                Ok(())
            })
            .sink("net", args, net_writer);
        chain.run().unwrap();
        chain.wait().unwrap();

        let fd = rx.into_raw_fd();
        let mut prev_seq = None;
        for i in 0..4u8 {
            let mut payload = [0u8; 256];
            let seq = recv_seq_payload(fd, &mut payload).unwrap();
            assert!(payload.iter().all(|&b| b == i));
            if let Some(p) = prev_seq {
                assert_eq!(seq, p + 1);
            }
            prev_seq = Some(seq);
        }
        unsafe { libc::close(fd) };
        assert_eq!(counter.load(Ordering::Relaxed), 4 * (8 + 256));
    }
}
