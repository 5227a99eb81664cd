//! Immutable change records.
//!
//! Every accepted edit becomes a `Change` shared between the model's change
//! stack and any segments that reference its payload after splits. The record
//! itself never mutates except for its serial, which is negated in place when
//! the change is undone and flipped back on redo.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// What an edit does to the logical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Delete,
    Insert,
    Overwrite,
}

/// A single immutable edit record.
///
/// Positive serial: active. Negative serial: undone, eligible for redo.
/// Serial zero is reserved for synthetic records the model creates internally
/// (the whole-file record backing READ segments and the DELETE half of an
/// OVERWRITE); synthetic records never appear on the change stack.
#[derive(Debug)]
pub struct Change {
    serial: AtomicI64,
    kind: ChangeKind,
    offset: i64,
    length: i64,
    bytes: Box<[u8]>,
    transaction_bit: bool,
}

impl Change {
    /// New INSERT record owning a copy of `bytes`.
    pub(crate) fn insert(serial: i64, offset: i64, bytes: &[u8], transaction_bit: bool) -> Self {
        Self {
            serial: AtomicI64::new(serial),
            kind: ChangeKind::Insert,
            offset,
            length: bytes.len() as i64,
            bytes: bytes.into(),
            transaction_bit,
        }
    }

    /// New OVERWRITE record owning a copy of `bytes`.
    pub(crate) fn overwrite(serial: i64, offset: i64, bytes: &[u8], transaction_bit: bool) -> Self {
        Self {
            serial: AtomicI64::new(serial),
            kind: ChangeKind::Overwrite,
            offset,
            length: bytes.len() as i64,
            bytes: bytes.into(),
            transaction_bit,
        }
    }

    /// New DELETE record. Carries no payload.
    pub(crate) fn delete(serial: i64, offset: i64, length: i64, transaction_bit: bool) -> Self {
        Self {
            serial: AtomicI64::new(serial),
            kind: ChangeKind::Delete,
            offset,
            length,
            bytes: Box::default(),
            transaction_bit,
        }
    }

    /// Synthetic DELETE with serial zero, used to model the delete half of an
    /// OVERWRITE without it appearing as a user-visible change.
    pub(crate) fn synthetic_delete(offset: i64, length: i64) -> Arc<Self> {
        Arc::new(Self::delete(0, offset, length, false))
    }

    /// Synthetic whole-file record READ segments point at. The payload stays
    /// empty; `length` is the backing file size so segment range checks hold.
    pub(crate) fn synthetic_whole_file(length: i64) -> Arc<Self> {
        Arc::new(Self {
            serial: AtomicI64::new(0),
            kind: ChangeKind::Insert,
            offset: 0,
            length,
            bytes: Box::default(),
            transaction_bit: false,
        })
    }

    pub fn serial(&self) -> i64 {
        self.serial.load(Ordering::Relaxed)
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn length(&self) -> i64 {
        self.length
    }

    /// Payload bytes. Empty for DELETE records.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Groups consecutive changes into one undo unit: a maximal run of equal
    /// bits is undone and redone together.
    pub fn transaction_bit(&self) -> bool {
        self.transaction_bit
    }

    /// Flip the serial's sign. Called on undo (positive -> negative) and redo
    /// (negative -> positive).
    pub(crate) fn negate_serial(&self) {
        self.serial.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(-s))
            .ok();
    }
}
