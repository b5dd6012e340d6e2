use thiserror::Error;

/// A stage's fatal failure. Cancellation (queue disabled, EINTR/EBADF after
/// the cancel thunk closed the descriptor) is not an error - stages simply
/// return `Ok` and drain.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    Msg(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn msg(m: impl Into<String>) -> Self {
        StageError::Msg(m.into())
    }
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("no such step #{0}")]
    NoSuchStep(usize),
    #[error("step #{0} carries different userdata than requested")]
    WrongUserdata(usize),
    #[error("chain already ran to completion; build a fresh one")]
    Finished,
    #[error("stage failure: {0}")]
    Stage(String),
}
