//! The reusable stages of the transfer engine: block sources, transforms
//! and sinks, composed into pipelines by the supervisor through
//! [`spool_chain::Chain`].

mod devices;
mod fdio;
mod sizes;
mod stats;

pub mod sinks;
pub mod sources;
pub mod transforms;

pub use devices::{DiskRead, FifoIo};
pub use sizes::{Sizes, SizesError};
pub use stats::PacketStats;

use spool_blocks::Block;
use spool_format::{FrameTime, TrackFormat};

/// A block known to contain exactly one data frame of a given format,
/// timestamp already decoded.
#[derive(Clone, Debug)]
pub struct Frame {
    pub format: TrackFormat,
    pub ntrack: u32,
    pub time: FrameTime,
    pub data: Block,
}

/// One element of a demultiplexed stream: channel splitters and the VDIF
/// reframer key their outputs by tag.
#[derive(Clone, Debug)]
pub struct Tagged<T> {
    pub tag: u32,
    pub item: T,
}

impl<T> Tagged<T> {
    pub fn new(tag: u32, item: T) -> Self {
        Tagged { tag, item }
    }
}
