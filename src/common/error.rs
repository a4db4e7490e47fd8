use thiserror::Error;

use super::types::{LockTarget, TxId};

/// Storage engine error types
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Offset {offset} with length {len} is outside the {size}-byte page")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Stored string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Transaction {tx} exhausted the buffer pool while pinning {target}")]
    ResourceExhausted { tx: TxId, target: String },

    #[error("Transaction {tx} timed out waiting for a lock on {target}")]
    LockTimeout { tx: TxId, target: LockTarget },

    #[error("Transaction {tx} was wounded by an older transaction")]
    Wounded { tx: TxId },

    #[error("Transaction {0} has already committed or rolled back")]
    TransactionFinished(TxId),
}

impl StrataError {
    /// Returns true for errors that require the whole transaction to be
    /// rolled back and re-executed.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            StrataError::ResourceExhausted { .. }
                | StrataError::LockTimeout { .. }
                | StrataError::Wounded { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
