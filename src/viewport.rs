//! Viewports: live windows over the logical file.
//!
//! A viewport materializes up to `capacity` bytes starting at its effective
//! offset. Fixed viewports stay put; floating viewports accumulate an offset
//! adjustment from every insert or delete landing at or before them, so they
//! stick to the content that was at their creation offset. Edits overlapping
//! the window set a dirty bit; the buffer is re-projected on the next read.

use crate::change::{Change, ChangeKind};
use crate::events::ViewportEvent;

/// Callback invoked for viewport events the interest mask selects.
pub type ViewportEventCallback = Box<dyn FnMut(ViewportId, ViewportEvent, Option<&Change>)>;

/// Generation-checked handle to a viewport owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewportId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

pub(crate) struct Viewport {
    pub(crate) offset: i64,
    pub(crate) capacity: i64,
    pub(crate) is_floating: bool,
    pub(crate) offset_adjustment: i64,
    pub(crate) dirty: bool,
    pub(crate) data: Vec<u8>,
    pub(crate) length: i64,
    pub(crate) event_interest: ViewportEvent,
    pub(crate) callback: Option<ViewportEventCallback>,
}

impl Viewport {
    pub(crate) fn new(offset: i64, capacity: i64, is_floating: bool) -> Self {
        Self {
            offset,
            capacity,
            is_floating,
            offset_adjustment: 0,
            dirty: true,
            data: vec![0; capacity as usize],
            length: 0,
            event_interest: ViewportEvent::empty(),
            callback: None,
        }
    }

    /// Where the viewport currently starts in the logical file.
    pub(crate) fn effective_offset(&self) -> i64 {
        self.offset + self.offset_adjustment
    }

    /// Update the floating adjustment for a change landing at or before the
    /// viewport. Overwrites shift nothing.
    pub(crate) fn track_adjustment(&mut self, change: &Change) {
        debug_assert!(change.length() > 0);
        if self.is_floating && change.offset() <= self.effective_offset() {
            match change.kind() {
                ChangeKind::Delete => self.offset_adjustment -= change.length(),
                ChangeKind::Insert => self.offset_adjustment += change.length(),
                ChangeKind::Overwrite => {}
            }
        }
    }

    /// Whether a change dirties this viewport. Inserts and deletes reach
    /// forward from their offset, so anything at or before the window end is
    /// affected; overwrites touch a bounded range and must intersect it.
    pub(crate) fn affected_by(&self, change: &Change) -> bool {
        debug_assert!(change.length() > 0);
        let start = self.effective_offset();
        let end = start + self.capacity;
        match change.kind() {
            ChangeKind::Delete | ChangeKind::Insert => change.offset() <= end,
            ChangeKind::Overwrite => {
                change.offset() + change.length() >= start && change.offset() <= end
            }
        }
    }

    /// Bytes the viewport would report for the given logical file size.
    pub(crate) fn computed_length(&self, file_size: i64) -> i64 {
        self.capacity.min((file_size - self.effective_offset()).max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(offset: i64, length: i64) -> Change {
        Change::insert(1, offset, &vec![b'x'; length as usize], false)
    }

    fn del(offset: i64, length: i64) -> Change {
        Change::delete(1, offset, length, false)
    }

    fn ovr(offset: i64, length: i64) -> Change {
        Change::overwrite(1, offset, &vec![b'x'; length as usize], false)
    }

    #[test]
    fn test_fixed_viewport_never_adjusts() {
        let mut vp = Viewport::new(10, 4, false);
        vp.track_adjustment(&ins(0, 5));
        vp.track_adjustment(&del(0, 5));
        assert_eq!(vp.effective_offset(), 10);
    }

    #[test]
    fn test_floating_adjustment_tracks_content() {
        let mut vp = Viewport::new(10, 4, true);
        vp.track_adjustment(&ins(2, 5));
        assert_eq!(vp.effective_offset(), 15);
        vp.track_adjustment(&del(0, 3));
        assert_eq!(vp.effective_offset(), 12);
        // Overwrites are size-neutral
        vp.track_adjustment(&ovr(0, 8));
        assert_eq!(vp.effective_offset(), 12);
    }

    #[test]
    fn test_floating_ignores_changes_beyond() {
        let mut vp = Viewport::new(10, 4, true);
        vp.track_adjustment(&ins(11, 5));
        assert_eq!(vp.effective_offset(), 10);
        // At the effective offset counts
        vp.track_adjustment(&ins(10, 2));
        assert_eq!(vp.effective_offset(), 12);
    }

    #[test]
    fn test_insert_delete_dirty_window() {
        let vp = Viewport::new(10, 4, false);
        assert!(vp.affected_by(&ins(0, 1)));
        assert!(vp.affected_by(&ins(14, 1)));
        assert!(!vp.affected_by(&ins(15, 1)));
        assert!(vp.affected_by(&del(14, 1)));
        assert!(!vp.affected_by(&del(15, 1)));
    }

    #[test]
    fn test_overwrite_dirty_requires_intersection() {
        let vp = Viewport::new(10, 4, false);
        assert!(!vp.affected_by(&ovr(0, 5)));
        // Closed on both sides: touching the start counts
        assert!(vp.affected_by(&ovr(5, 5)));
        assert!(vp.affected_by(&ovr(12, 1)));
        assert!(vp.affected_by(&ovr(14, 3)));
        assert!(!vp.affected_by(&ovr(15, 1)));
    }

    #[test]
    fn test_reported_length_clamps() {
        let vp = Viewport::new(10, 4, false);
        assert_eq!(vp.computed_length(20), 4);
        assert_eq!(vp.computed_length(12), 2);
        assert_eq!(vp.computed_length(10), 0);
        assert_eq!(vp.computed_length(3), 0);
    }
}
