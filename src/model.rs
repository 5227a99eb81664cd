//! The segment model.
//!
//! A model partitions the logical file into an ordered, contiguous run of
//! segments, each pointing either into the backing file (READ) or into the
//! payload of a change record (INSERT). Edits rewrite the partition: inserts
//! split a segment and splice a new one in, deletes consume segments and trim
//! the stragglers, overwrites are a synthetic delete followed by an insert.
//! DELETE needs no segment kind of its own; removal and trimming cover it.
//!
//! The model expects changes carrying original offsets and lengths and keeps
//! the computed offsets and lengths itself. Continuity (each segment starting
//! where the previous one ended) is checked whenever the list is walked; a
//! break means the engine corrupted its own state and is fatal.

use std::io::Write;
use std::sync::Arc;

use tracing::error;

use crate::backing::Backing;
use crate::change::{Change, ChangeKind};
use crate::error::{EditError, Result};

const SAVE_CHUNK: i64 = 64 * 1024;

/// Where a segment's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    /// The model's backing file; `change_offset` is a file offset.
    Read,
    /// A change payload; `change_offset` indexes into the change's bytes.
    Insert,
}

/// One contiguous run of the logical file.
#[derive(Debug, Clone)]
pub(crate) struct ModelSegment {
    pub(crate) kind: SegmentKind,
    pub(crate) computed_offset: i64,
    pub(crate) computed_length: i64,
    pub(crate) change_offset: i64,
    pub(crate) change: Arc<Change>,
}

impl ModelSegment {
    fn inserted(change: &Arc<Change>) -> Self {
        Self {
            kind: SegmentKind::Insert,
            computed_offset: change.offset(),
            computed_length: change.length(),
            change_offset: 0,
            change: Arc::clone(change),
        }
    }
}

/// Segment list plus change and undo stacks over one backing file. One model
/// per checkpoint level; only the top model of a session receives edits.
#[derive(Debug)]
pub(crate) struct Model {
    pub(crate) backing: Backing,
    pub(crate) segments: Vec<ModelSegment>,
    pub(crate) changes: Vec<Arc<Change>>,
    pub(crate) changes_undone: Vec<Arc<Change>>,
}

impl Model {
    /// Log the whole partition, then abort. Continuity breaks are engine
    /// bugs; there is no recovering a corrupt model.
    #[cold]
    fn continuity_panic(&self, expected: i64, got: i64) -> ! {
        for seg in &self.segments {
            error!(
                kind = ?seg.kind,
                computed_offset = seg.computed_offset,
                computed_length = seg.computed_length,
                change_offset = seg.change_offset,
                serial = seg.change.serial(),
                "model segment"
            );
        }
        error!(expected, got, "break in model continuity");
        panic!("break in model continuity, expected: {expected}, got: {got}");
    }

    pub(crate) fn new(backing: Backing) -> Self {
        let mut model = Self {
            backing,
            segments: Vec::new(),
            changes: Vec::new(),
            changes_undone: Vec::new(),
        };
        model.reset_segments();
        model
    }

    /// Reset the partition to a single READ segment spanning the backing
    /// file. An empty backing yields an empty list.
    pub(crate) fn reset_segments(&mut self) {
        self.segments.clear();
        let length = self.backing.len();
        if length > 0 {
            let whole = Change::synthetic_whole_file(length);
            self.segments.push(ModelSegment {
                kind: SegmentKind::Read,
                computed_offset: 0,
                computed_length: length,
                change_offset: 0,
                change: whole,
            });
        }
    }

    /// Logical file size: where the last segment ends.
    pub(crate) fn computed_size(&self) -> i64 {
        self.segments
            .last()
            .map_or(0, |seg| seg.computed_offset + seg.computed_length)
    }

    /// Apply one change to the partition. OVERWRITE is modeled as a clipped
    /// synthetic DELETE followed by the overwrite's own insertion, so the
    /// change stack records a single user-visible change.
    pub(crate) fn apply_change(&mut self, change: &Arc<Change>) {
        if change.kind() == ChangeKind::Overwrite {
            let size = self.computed_size();
            let delete_length = change.length().min(size - change.offset());
            if delete_length > 0 {
                let del = Change::synthetic_delete(change.offset(), delete_length);
                self.apply(&del);
            }
        }
        self.apply(change);
    }

    fn apply(&mut self, change: &Arc<Change>) {
        if self.segments.is_empty() {
            if change.kind() != ChangeKind::Delete {
                // Empty model and a change with content
                self.segments.push(ModelSegment::inserted(change));
            }
            return;
        }
        let mut read_offset = 0i64;
        let mut i = 0usize;
        while i < self.segments.len() {
            if read_offset != self.segments[i].computed_offset {
                self.continuity_panic(read_offset, self.segments[i].computed_offset);
            }
            let seg_length = self.segments[i].computed_length;
            if change.offset() >= read_offset && change.offset() <= read_offset + seg_length {
                if change.offset() != read_offset {
                    let delta = change.offset() - self.segments[i].computed_offset;
                    if delta == seg_length {
                        // The change lands right at the end of this segment
                        i += 1;
                    } else {
                        // The change site falls inside this segment: split it.
                        // The left half keeps the prefix; the right half is a
                        // clone advanced by delta, and i moves onto it so the
                        // change lands at its start.
                        let mut right = self.segments[i].clone();
                        right.computed_offset += delta;
                        right.computed_length -= delta;
                        right.change_offset += delta;
                        self.segments[i].computed_length = delta;
                        self.segments.insert(i + 1, right);
                        i += 1;
                    }
                }
                match change.kind() {
                    ChangeKind::Delete => {
                        let mut remaining = change.length();
                        while remaining > 0 && i < self.segments.len() {
                            if self.segments[i].computed_length <= remaining {
                                // DELETE spans the entire segment
                                remaining -= self.segments[i].computed_length;
                                self.segments.remove(i);
                            } else {
                                // DELETE trims the front of the segment
                                let seg = &mut self.segments[i];
                                seg.computed_length -= remaining;
                                seg.computed_offset += remaining - change.length();
                                seg.change_offset += remaining;
                                debug_assert!(seg.change_offset < seg.change.length());
                                remaining = 0;
                                i += 1;
                            }
                        }
                        // Shift everything beyond the delete site left
                        for seg in &mut self.segments[i..] {
                            seg.computed_offset -= change.length();
                        }
                    }
                    ChangeKind::Insert | ChangeKind::Overwrite => {
                        self.segments.insert(i, ModelSegment::inserted(change));
                        for seg in &mut self.segments[i + 1..] {
                            seg.computed_offset += change.length();
                        }
                    }
                }
                return;
            }
            read_offset += seg_length;
            i += 1;
        }
        // The session validates offsets before submission
        self.continuity_panic(change.offset(), read_offset);
    }

    /// Rebuild the partition from scratch by replaying the change stack.
    /// Used by undo, which has no inverse operation per change kind.
    pub(crate) fn rebuild(&mut self) {
        self.reset_segments();
        let changes: Vec<Arc<Change>> = self.changes.clone();
        for change in &changes {
            self.apply_change(change);
        }
    }

    /// Project the logical range starting at `offset` into `dst`, returning
    /// how many bytes were written. Short reads happen only at end of file.
    pub(crate) fn project_into(&self, offset: i64, dst: &mut [u8]) -> Result<usize> {
        if offset < 0 {
            return Err(EditError::InvalidOffset { offset, size: self.computed_size() });
        }
        if dst.is_empty() || offset >= self.computed_size() {
            return Ok(0);
        }
        // First segment whose range contains offset
        let mut idx = self.segments.partition_point(|seg| seg.computed_offset <= offset) - 1;
        let mut delta = offset - self.segments[idx].computed_offset;
        let mut expected = self.segments[idx].computed_offset;
        let mut written = 0usize;
        while written < dst.len() && idx < self.segments.len() {
            let seg = &self.segments[idx];
            if seg.computed_offset != expected {
                self.continuity_panic(expected, seg.computed_offset);
            }
            let amount = (seg.computed_length - delta).min((dst.len() - written) as i64);
            let out = &mut dst[written..written + amount as usize];
            match seg.kind {
                SegmentKind::Read => {
                    out.copy_from_slice(self.backing.slice(seg.change_offset + delta, amount)?);
                }
                SegmentKind::Insert => {
                    let start = (seg.change_offset + delta) as usize;
                    out.copy_from_slice(&seg.change.bytes()[start..start + amount as usize]);
                }
            }
            written += amount as usize;
            expected = seg.computed_offset + seg.computed_length;
            delta = 0;
            idx += 1;
        }
        Ok(written)
    }

    /// Stream the whole logical file to `out`, walking segments in order.
    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut write_offset = 0i64;
        for seg in &self.segments {
            if write_offset != seg.computed_offset {
                self.continuity_panic(write_offset, seg.computed_offset);
            }
            match seg.kind {
                SegmentKind::Read => {
                    let mut pos = 0i64;
                    while pos < seg.computed_length {
                        let amount = SAVE_CHUNK.min(seg.computed_length - pos);
                        out.write_all(self.backing.slice(seg.change_offset + pos, amount)?)?;
                        pos += amount;
                    }
                }
                SegmentKind::Insert => {
                    let start = seg.change_offset as usize;
                    let end = start + seg.computed_length as usize;
                    out.write_all(&seg.change.bytes()[start..end])?;
                }
            }
            write_offset += seg.computed_length;
        }
        Ok(())
    }

    /// Audit the partition invariants: contiguity from zero, positive
    /// lengths, and segment ranges contained in their change records.
    pub(crate) fn audit(&self) -> bool {
        let mut expected = 0i64;
        for seg in &self.segments {
            if seg.computed_offset != expected
                || seg.computed_length <= 0
                || seg.change_offset < 0
                || seg.change_offset + seg.computed_length > seg.change.length()
            {
                return false;
            }
            expected += seg.computed_length;
        }
        true
    }
}
