mod check;
mod fd;
mod fifo;
mod multi;
mod net;
mod queue;
mod udp;

pub use check::{CheckArgs, bitbucket, fill_checker};
pub use fd::{FdWriteArgs, fd_writer, sfxc_writer};
pub use fifo::{FifoWriteArgs, fifo_writer};
pub use multi::{MultiArgs, multi_writer};
pub use net::{NetWriteArgs, net_writer};
pub use queue::{QueueWriteArgs, queue_writer};
pub use udp::{udp_writer, udps_writer, vtp_writer};
