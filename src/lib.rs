//! Scalpel: segmented out-of-core editing of very large binary files.
//!
//! A [`Session`] opens a read-only backing file (or starts empty) and models
//! every insert / overwrite / delete as an immutable [`Change`] rewriting an
//! ordered segment list, so the original file is never touched. Any byte
//! range of the evolving logical file can be projected on demand, observed
//! through live viewports, searched, undone and redone, checkpointed, and
//! finally saved to a new contiguous file.
//!
//! The backing file is memory-mapped read-only; inserted bytes live in the
//! change records that produced them. Projection walks the segment list and
//! pulls from whichever source each segment points at.

pub mod backing;
pub mod change;
pub mod error;
pub mod events;
pub mod model;
pub mod search;
pub mod session;
pub mod viewport;

pub use change::{Change, ChangeKind};
pub use error::{EditError, Result};
pub use events::{SessionEvent, ViewportEvent};
pub use search::SearchId;
pub use session::{Session, SessionEventCallback, TransactionState};
pub use viewport::{ViewportEventCallback, ViewportId};

/// Upper bound on a single viewport's capacity, in bytes.
pub const VIEWPORT_CAPACITY_LIMIT: i64 = 1 << 20;

/// Upper bound on a search pattern's length, in bytes. Search windows are
/// twice this size.
pub const SEARCH_PATTERN_LENGTH_LIMIT: i64 = 1 << 12;
