mod disk;
mod fd;
mod fifo;
mod fill;
mod net;
mod queue;
mod udps;

pub use disk::{DiskArgs, disk_reader};
pub use fd::{FdReadArgs, fd_reader};
pub use fifo::{FifoReadArgs, fifo_reader};
pub use fill::{FillArgs, fill_generator};
pub use net::{NetReadArgs, net_reader, socket_reader, udp_reader};
pub use queue::{QueueReadArgs, queue_reader, stupid_queue_reader};
pub use udps::{FlaggedBlock, UdpsArgs, UdpsTopArgs, udps_bottom_half, udps_top_half};
