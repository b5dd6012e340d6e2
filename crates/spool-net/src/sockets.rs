use std::{
    fs::OpenOptions,
    io,
    mem,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    os::fd::{IntoRawFd, RawFd},
    os::unix::net::{UnixListener, UnixStream},
    sync::Arc,
};

use strum::{Display, EnumString};
use tracing::debug;

use crate::{FdGuard, NetError};

/// Transport family of a transfer. `Rtcp` is tcp with the dialing
/// direction reversed (the data *sender* listens); `Vtp` is udp carrying
/// one sequence-numbered frame per datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum NetProtocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "udps")]
    Udps,
    #[strum(serialize = "udp+vdif", serialize = "vtp", to_string = "udp+vdif")]
    Vtp,
    #[strum(serialize = "unix")]
    Unix,
    #[strum(serialize = "rtcp")]
    Rtcp,
}

impl NetProtocol {
    pub fn is_datagram(self) -> bool {
        matches!(self, NetProtocol::Udp | NetProtocol::Udps | NetProtocol::Vtp)
    }

    /// Bytes of IP + transport + sequence overhead per datagram, for the
    /// mtu arithmetic of the constraint solver.
    pub fn datagram_overhead(self) -> usize {
        match self {
            NetProtocol::Udps | NetProtocol::Vtp => 20 + 8 + 8,
            NetProtocol::Udp => 20 + 8,
            _ => 0,
        }
    }
}

/// An opened endpoint: the descriptor plus whether a reader/writer must
/// still `accept()` on it before data can flow.
pub struct NetSock {
    pub guard: Arc<FdGuard>,
    pub needs_accept: bool,
}

impl NetSock {
    fn ready(fd: RawFd) -> Self {
        NetSock { guard: Arc::new(FdGuard::new(fd)), needs_accept: false }
    }

    fn listening(fd: RawFd) -> Self {
        NetSock { guard: Arc::new(FdGuard::new(fd)), needs_accept: true }
    }
}

/// Data-receiving end of a transfer ("net_protocol" server). tcp/unix
/// listen and later accept; udp flavours bind; rtcp dials out to the
/// remote listener.
pub fn net_server(
    proto: NetProtocol,
    host: &str,
    port: u16,
    sndbuf: Option<usize>,
    rcvbuf: Option<usize>,
) -> Result<NetSock, NetError> {
    let sock = match proto {
        NetProtocol::Tcp => NetSock::listening(bind_tcp_listener(local_addr(host, port)?)?),
        NetProtocol::Udp | NetProtocol::Udps | NetProtocol::Vtp => {
            let udp = UdpSocket::bind(local_addr(host, port)?)?;
            NetSock::ready(udp.into_raw_fd())
        }
        NetProtocol::Unix => {
            let _ = std::fs::remove_file(host);
            let l = UnixListener::bind(host)?;
            NetSock::listening(l.into_raw_fd())
        }
        NetProtocol::Rtcp => {
            let stream = TcpStream::connect(resolve(host, port)?)?;
            NetSock::ready(stream.into_raw_fd())
        }
    };
    set_socket_bufs(sock.guard.fd(), sndbuf, rcvbuf);
    debug!(%proto, host, port, fd = sock.guard.fd(), accept = sock.needs_accept, "net server socket");
    Ok(sock)
}

/// Data-sending end of a transfer. tcp/udp flavours dial the remote side;
/// rtcp listens for the remote receiver to call in.
pub fn net_client(
    proto: NetProtocol,
    host: &str,
    port: u16,
    sndbuf: Option<usize>,
    rcvbuf: Option<usize>,
) -> Result<NetSock, NetError> {
    let sock = match proto {
        NetProtocol::Tcp => NetSock::ready(TcpStream::connect(resolve(host, port)?)?.into_raw_fd()),
        NetProtocol::Udp | NetProtocol::Udps | NetProtocol::Vtp => {
            let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            udp.connect(resolve(host, port)?)?;
            NetSock::ready(udp.into_raw_fd())
        }
        NetProtocol::Unix => NetSock::ready(UnixStream::connect(host)?.into_raw_fd()),
        NetProtocol::Rtcp => {
            NetSock::listening(bind_tcp_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?)
        }
    };
    set_socket_bufs(sock.guard.fd(), sndbuf, rcvbuf);
    debug!(%proto, host, port, fd = sock.guard.fd(), accept = sock.needs_accept, "net client socket");
    Ok(sock)
}

/// Rendezvous listener on a unix path (the sfxc handshake).
pub fn open_unix_server(path: &str) -> Result<Arc<FdGuard>, NetError> {
    let _ = std::fs::remove_file(path);
    let l = UnixListener::bind(path)?;
    let fd = l.into_raw_fd();
    debug!(path, fd, "unix server socket");
    Ok(Arc::new(FdGuard::new(fd)))
}

/// Block in accept(2); returns the connection fd plus a printable peer.
pub fn accept_incoming(fd: RawFd) -> io::Result<(RawFd, String)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let conn = unsafe {
        libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if conn < 0 {
        return Err(io::Error::last_os_error());
    }
    let peer = sockaddr_to_string(&storage);
    Ok((conn, peer))
}

/// An opened regular file from a `path,r|w|a` spec: "r" reads, "w"
/// truncates or creates, "a" appends.
pub struct OpenedFile {
    pub guard: Arc<FdGuard>,
    /// size at open, for the read side's end pointer
    pub size: u64,
}

pub fn open_file(spec: &str) -> Result<OpenedFile, NetError> {
    let (path, mode) = spec
        .rsplit_once(',')
        .ok_or_else(|| NetError::BadFileSpec(spec.to_string()))?;
    if path.is_empty() {
        return Err(NetError::BadFileSpec(spec.to_string()));
    }
    let mut opts = OpenOptions::new();
    match mode {
        "r" => opts.read(true),
        "w" => opts.write(true).create(true).truncate(true),
        "a" => opts.write(true).create(true).append(true),
        _ => return Err(NetError::BadFileSpec(spec.to_string())),
    };
    let file = opts.open(path)?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    debug!(path, mode, size, "opened file");
    Ok(OpenedFile { guard: Arc::new(FdGuard::new(file.into_raw_fd())), size })
}

/// Normal-termination check: EINTR from the kick signal or EBADF after the
/// cancel thunk closed the descriptor under us.
pub fn is_cancelled(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EBADF))
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| NetError::Resolve(host.to_string()))?
        .next()
        .ok_or_else(|| NetError::Resolve(host.to_string()))
}

fn local_addr(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    if host.is_empty() {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(SocketAddr::from((ip, port))),
        Err(_) => resolve(host, port),
    }
}

/// TCP listener with SO_REUSEADDR, the way station control software
/// expects a recorder to come back up on the same port immediately.
fn bind_tcp_listener(addr: SocketAddr) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let (storage, len) = sockaddr_from(addr);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0
            || libc::listen(fd, 4) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}

fn set_socket_bufs(fd: RawFd, sndbuf: Option<usize>, rcvbuf: Option<usize>) {
    unsafe {
        if let Some(size) = sndbuf {
            let size = size as libc::c_int;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        if let Some(size) = rcvbuf {
            let size = size as libc::c_int;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

pub(crate) fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

pub(crate) fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::from((
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::from((
                std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
            )))
        }
        _ => None,
    }
}

fn sockaddr_to_string(storage: &libc::sockaddr_storage) -> String {
    sockaddr_to_addr(storage)
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unix".to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_strings() {
        assert_eq!("udps".parse::<NetProtocol>().unwrap(), NetProtocol::Udps);
        assert_eq!("udp+vdif".parse::<NetProtocol>().unwrap(), NetProtocol::Vtp);
        assert_eq!("vtp".parse::<NetProtocol>().unwrap(), NetProtocol::Vtp);
        assert_eq!(NetProtocol::Vtp.to_string(), "udp+vdif");
        assert!("quic".parse::<NetProtocol>().is_err());
    }

    #[test]
    fn datagram_overheads() {
        assert_eq!(NetProtocol::Udps.datagram_overhead(), 36);
        assert_eq!(NetProtocol::Udp.datagram_overhead(), 28);
        assert_eq!(NetProtocol::Tcp.datagram_overhead(), 0);
        assert!(!NetProtocol::Tcp.is_datagram());
    }

    #[test]
    fn file_spec_parsing() {
        assert!(matches!(open_file("no-mode-here"), Err(NetError::BadFileSpec(_))));
        assert!(matches!(open_file("/tmp/x,q"), Err(NetError::BadFileSpec(_))));

        let dir = std::env::temp_dir().join("spool-sockets-test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("afile");
        let spec = format!("{},w", path.display());
        let opened = open_file(&spec).unwrap();
        assert!(!opened.guard.is_closed());
        drop(opened);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sockaddr_roundtrip_v4() {
        let addr: SocketAddr = "192.168.7.9:2630".parse().unwrap();
        let (storage, _) = sockaddr_from(addr);
        assert_eq!(sockaddr_to_addr(&storage), Some(addr));
    }
}
