use thiserror::Error;

pub type Result<T> = std::result::Result<T, FimError>;

#[derive(Debug, Error)]
pub enum FimError {
    #[error("invalid target pid: {0}")]
    InvalidPid(i32),

    #[error("failed to attach to pid {0}: {1}")]
    AttachFailed(i32, String),

    #[error("unexpected stop while attaching to pid {0}: {1}")]
    UnexpectedStop(i32, String),

    #[error("failed to detach from pid {0}: {1}")]
    DetachFailed(i32, String),

    #[error("failed to refresh memory map: {0}")]
    RefreshFailed(String),

    #[error("not attached to target process")]
    NotAttached,

    #[error("read of {len} bytes at {addr:#x} failed: {reason}")]
    ReadFailed {
        addr: u64,
        len: usize,
        reason: String,
    },

    #[error("write of {len} bytes at {addr:#x} failed: {reason}")]
    WriteFailed {
        addr: u64,
        len: usize,
        reason: String,
    },

    #[error("no checkpoint to restore")]
    NoCheckpoint,

    #[error("memory layout drifted since the checkpoint was taken")]
    RegionDrift,

    #[error("checkpoint creation failed: {0}")]
    CheckpointFailed(String),

    #[error("checkpoint restore failed: {0}")]
    RestoreFailed(String),

    #[error("signal operation failed: {0}")]
    SignalFailed(String),

    #[error("scan worker thread panicked")]
    ThreadJoin,
}
