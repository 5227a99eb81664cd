//! Error types for the edit engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EditError>;

#[derive(Error, Debug)]
pub enum EditError {
    #[error("Offset {offset} out of range for logical size {size}")]
    InvalidOffset { offset: i64, size: i64 },

    #[error("Invalid length: {0}")]
    InvalidLength(i64),

    #[error("Viewport capacity out of range: {0}")]
    CapacityOutOfRange(i64),

    #[error("Search pattern too long: {0}")]
    PatternTooLong(i64),

    #[error("Search pattern longer than the searched range")]
    PatternExceedsRange,

    #[error("No change to undo")]
    NoChangeToUndo,

    #[error("No undone change to redo")]
    NoUndoToRedo,

    #[error("No checkpoint to destroy")]
    CheckpointMissing,

    #[error("A transaction is already open")]
    TransactionAlreadyOpen,

    #[error("No transaction is open")]
    NoOpenTransaction,

    #[error("Handle refers to a destroyed viewport or search context")]
    StaleHandle,

    #[error("No available filename for save target")]
    NoAvailableFilename,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
