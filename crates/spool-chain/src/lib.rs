mod chain;
mod error;
mod queue;
mod sync;

pub use chain::{Chain, ChainBuilder, Inq, Outq, StepId};
pub use error::{ChainError, StageError};
pub use queue::{Pop, Queue, TryPush};
pub use sync::SyncArgs;
