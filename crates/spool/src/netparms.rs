use spool_net::NetProtocol;

/// Network knobs of the runtime, set through `net_protocol=`, `mtu=` and
/// `ipd=` and consumed by the constraint solver and the net stages.
#[derive(Clone, Debug)]
pub struct NetParms {
    pub protocol: NetProtocol,
    pub mtu: usize,
    /// microseconds between datagrams; negative selects the theoretical
    /// value derived from the data rate
    pub ipd_us: i64,
    /// one ACK datagram per this many received packets, 0 suppresses them
    pub ack_period: u32,
    /// readahead blocks of the sequenced reader
    pub nblock: usize,
    pub sndbuf: Option<usize>,
    pub rcvbuf: Option<usize>,
    pub port: u16,
    pub allow_variable_block_size: bool,
    /// preferred queue element size; the solver rounds it to fit
    pub blocksize: usize,
}

impl Default for NetParms {
    fn default() -> Self {
        NetParms {
            protocol: NetProtocol::Tcp,
            mtu: 1500,
            ipd_us: 0,
            ack_period: 10,
            nblock: 8,
            sndbuf: Some(4 * 1024 * 1024),
            rcvbuf: Some(4 * 1024 * 1024),
            port: 2630,
            allow_variable_block_size: false,
            blocksize: 128 * 1024,
        }
    }
}
