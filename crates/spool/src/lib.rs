//! Control plane of the recorder: the per-device [`Runtime`], the
//! constraint solver binding mode knobs to stage geometry, and the
//! transfer supervisor that turns "disk2net=connect:..." into a running
//! chain of stages.

mod constraints;
mod device;
mod mode;
mod netparms;
mod reply;
mod runtime;
mod stats;
pub mod supervisor;
mod trackmask;

pub use constraints::{SolveError, solve_sizes, theoretical_ipd_us};
pub use device::{BankId, BlockDevice, DeviceError, IoBoard, IoReg, RamPack, RecordState, Scan};
pub use spool_stages::{DiskRead, FifoIo};
pub use mode::{DeviceClass, SubMode, TransferMode};
pub use netparms::NetParms;
pub use reply::Reply;
pub use runtime::{ActiveTransfer, PlayRange, Runtime};
pub use stats::CounterRegistry;
pub use supervisor::Supervisor;
pub use trackmask::{TrackmaskState, TrackmaskStatus};
