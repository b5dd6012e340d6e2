mod ack;
mod fdguard;
mod sockets;
mod udps;

pub use ack::AckRotation;
pub use fdguard::FdGuard;
pub use sockets::{
    NetProtocol, NetSock, OpenedFile, accept_incoming, is_cancelled, net_client, net_server,
    open_file, open_unix_server,
};
pub use udps::{SEQ_SIZE, peek_seqnr, recv_into, recv_seq_payload, send_ack, send_seq_payload};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("bad file spec '{0}': want path,r|w|a")]
    BadFileSpec(String),
    #[error("protocol '{0}' not usable here")]
    BadProtocol(String),
    #[error("could not resolve '{0}'")]
    Resolve(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
