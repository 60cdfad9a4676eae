//! File transfer over the reliable channel.
//!
//! [`sender::FileSender`] drives OFFER → ACCEPT → DATA → COMPLETE →
//! VERIFIED; [`receiver::FileReceiver`] mirrors it, writing chunks at their
//! byte offsets and checkpointing progress so an interrupted transfer can
//! resume. The receiver verifies a whole-file SHA-256 before acknowledging.

mod latch;

pub mod checkpoint;
pub mod progress;
pub mod receiver;
pub mod sender;
pub mod state;

pub use checkpoint::Checkpoint;
pub use progress::TransferProgress;
pub use receiver::FileReceiver;
pub use sender::FileSender;
pub use state::TransferState;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("transfer rejected by receiver")]
    Rejected,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("file digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("unsafe filename in offer: {0:?}")]
    UnsafeFilename(String),
    #[error(transparent)]
    Channel(#[from] punchdrop_transport::channel::ChannelError),
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),
}
