mod bufferer;
mod compress;
mod faker;
mod framer;
mod reframe;
mod split;
mod time;

pub use bufferer::{BuffererArgs, bufferer};
pub use compress::{
    CompressArgs, block_compressor, block_decompressor, frame_compressor,
};
pub use faker::{FakerArgs, faker};
pub use framer::{FramerArgs, frame_to_block, framer};
pub use reframe::{ReframeArgs, reframe_to_vdif};
pub use split::{SplitArgs, SplitFn, coalescing_splitter, lookup_splitter, tagger};
pub use time::{TimeGrab, TimeGrabArgs, timedecoder, timegrabber, timeprinter};
