use std::{io, mem, net::SocketAddr, os::fd::RawFd};

use crate::sockets::{sockaddr_from, sockaddr_to_addr};

/// Every sequenced datagram starts with this much little-endian sequence
/// number.
pub const SEQ_SIZE: usize = 8;

/// Peek the sequence number of the next datagram without consuming it, and
/// record who sent it (for the ACK back-traffic). Blocks until a datagram
/// is there.
pub fn peek_seqnr(fd: RawFd) -> io::Result<(u64, Option<SocketAddr>)> {
    let mut seq = [0u8; SEQ_SIZE];
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut slen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            seq.as_mut_ptr() as *mut libc::c_void,
            SEQ_SIZE,
            libc::MSG_PEEK,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut slen,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if (n as usize) < SEQ_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("datagram too short for a sequence number: {n} bytes"),
        ));
    }
    Ok((u64::from_le_bytes(seq), sockaddr_to_addr(&storage)))
}

/// Consume one datagram: 8-byte header into the returned value, payload
/// straight into `payload` (the packet's final resting place - no copy).
pub fn recv_seq_payload(fd: RawFd, payload: &mut [u8]) -> io::Result<u64> {
    let mut seq = [0u8; SEQ_SIZE];
    let mut iov = [
        libc::iovec { iov_base: seq.as_mut_ptr() as *mut libc::c_void, iov_len: SEQ_SIZE },
        libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        },
    ];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = 2;

    let want = SEQ_SIZE + payload.len();
    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_WAITALL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if (n as usize) != want {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short datagram: asked {want} got {n}"),
        ));
    }
    Ok(u64::from_le_bytes(seq))
}

/// Plain receive into a buffer (discard reads, unsequenced udp).
pub fn recv_into(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Send one sequenced datagram on a connected socket: header and payload
/// leave as a single datagram via a two-entry iovec.
pub fn send_seq_payload(fd: RawFd, seqnr: u64, payload: &[u8]) -> io::Result<()> {
    let seq = seqnr.to_le_bytes();
    let mut iov = [
        libc::iovec { iov_base: seq.as_ptr() as *mut libc::c_void, iov_len: SEQ_SIZE },
        libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        },
    ];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = 2;

    let want = SEQ_SIZE + payload.len();
    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if (n as usize) != want {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short send: asked {want} sent {n}"),
        ));
    }
    Ok(())
}

/// Unsolicited short datagram back at the data sender. Failure is the
/// caller's to shrug over.
pub fn send_ack(fd: RawFd, to: SocketAddr, payload: &[u8]) -> io::Result<()> {
    let (storage, slen) = sockaddr_from(to);
    let n = unsafe {
        libc::sendto(
            fd,
            payload.as_ptr() as *const libc::c_void,
            payload.len(),
            0,
            &storage as *const _ as *const libc::sockaddr,
            slen,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{net::UdpSocket, os::fd::AsRawFd};

    use super::*;

    fn pair() -> (UdpSocket, UdpSocket) {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.connect(rx.local_addr().unwrap()).unwrap();
        (rx, tx)
    }

    #[test]
    fn peek_does_not_consume() {
        let (rx, tx) = pair();
        send_seq_payload(tx.as_raw_fd(), 4242, &[7u8; 64]).unwrap();

        let (seq, sender) = peek_seqnr(rx.as_raw_fd()).unwrap();
        assert_eq!(seq, 4242);
        assert_eq!(sender.unwrap(), tx.local_addr().unwrap());

        // still there
        let mut payload = [0u8; 64];
        let seq2 = recv_seq_payload(rx.as_raw_fd(), &mut payload).unwrap();
        assert_eq!(seq2, 4242);
        assert_eq!(payload, [7u8; 64]);
    }

    #[test]
    fn sequence_survives_the_wire() {
        let (rx, tx) = pair();
        for seq in [u64::MAX - 1, 0, 1 << 40] {
            send_seq_payload(tx.as_raw_fd(), seq, &[1u8; 16]).unwrap();
            let mut p = [0u8; 16];
            assert_eq!(recv_seq_payload(rx.as_raw_fd(), &mut p).unwrap(), seq);
        }
    }

    #[test]
    fn ack_reaches_the_sender() {
        let (rx, tx) = pair();
        send_seq_payload(tx.as_raw_fd(), 1, &[0u8; 8]).unwrap();
        let (_, sender) = peek_seqnr(rx.as_raw_fd()).unwrap();
        let mut sink = [0u8; 8];
        recv_seq_payload(rx.as_raw_fd(), &mut sink).unwrap();

        send_ack(rx.as_raw_fd(), sender.unwrap(), b"ahoy").unwrap();
        let mut ack = [0u8; 16];
        let n = recv_into(tx.as_raw_fd(), &mut ack).unwrap();
        assert_eq!(&ack[..n], b"ahoy");
    }
}
