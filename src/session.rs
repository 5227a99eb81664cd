//! Editing sessions.
//!
//! A session owns a stack of models (the checkpoint chain), the viewports and
//! search contexts observing it, and the event plumbing. Only the top model
//! receives edits. Each accepted edit becomes a change record, rewrites the
//! top model's segment list, dirties affected viewports, and fires events
//! synchronously before the call returns.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::backing::Backing;
use crate::change::Change;
use crate::error::{EditError, Result};
use crate::events::{SessionEvent, ViewportEvent};
use crate::model::Model;
use crate::search::{SearchContext, SearchId};
use crate::viewport::{Viewport, ViewportEventCallback, ViewportId};
use crate::{SEARCH_PATTERN_LENGTH_LIMIT, VIEWPORT_CAPACITY_LIMIT};

const PROFILE_TILE: i64 = 8 * 1024;

/// Callback invoked for session events the interest mask selects.
pub type SessionEventCallback = Box<dyn FnMut(SessionEvent, Option<&Change>)>;

/// Transaction progress. At most one transaction is open per session; the
/// first edit after `Opened` moves it to `InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    Opened,
    InProgress,
}

/// Generation-checked storage cell for viewports and search contexts.
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

fn allocate<T>(slots: &mut Vec<Slot<T>>, value: T) -> (u32, u32) {
    if let Some(index) = slots.iter().position(|slot| slot.value.is_none()) {
        slots[index].value = Some(value);
        (index as u32, slots[index].generation)
    } else {
        slots.push(Slot { generation: 0, value: Some(value) });
        ((slots.len() - 1) as u32, 0)
    }
}

fn fire_viewport_event(
    paused: bool,
    id: ViewportId,
    viewport: &mut Viewport,
    event: ViewportEvent,
    change: Option<&Change>,
) {
    if paused {
        return;
    }
    if viewport.event_interest.intersects(event) {
        if let Some(cbk) = viewport.callback.as_mut() {
            cbk(id, event, change);
        }
    }
}

/// An editing session over one logical file.
pub struct Session {
    models: Vec<Model>,
    viewports: Vec<Slot<Viewport>>,
    searches: Vec<Slot<SearchContext>>,
    event_interest: SessionEvent,
    event_callback: Option<SessionEventCallback>,
    changes_paused: bool,
    viewport_callbacks_paused: bool,
    transaction_state: TransactionState,
    num_changes_adjustment: i64,
}

impl Session {
    // -- Construction ---------------------------------------------------------

    /// Session starting from scratch: logical size zero until the first
    /// insert.
    pub fn new() -> Self {
        Self::from_backing(Backing::empty())
    }

    /// Session over an existing file, opened read-only. The file is never
    /// modified; edits live in memory until [`Session::save`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_backing(Backing::open(path.as_ref())?))
    }

    fn from_backing(backing: Backing) -> Self {
        Self {
            models: vec![Model::new(backing)],
            viewports: Vec::new(),
            searches: Vec::new(),
            event_interest: SessionEvent::empty(),
            event_callback: None,
            changes_paused: false,
            viewport_callbacks_paused: false,
            transaction_state: TransactionState::None,
            num_changes_adjustment: 0,
        }
    }

    /// Install the session event callback and fire `CREATE`.
    pub fn with_event_callback(
        mut self,
        interest: SessionEvent,
        cbk: impl FnMut(SessionEvent, Option<&Change>) + 'static,
    ) -> Self {
        self.event_interest = interest;
        self.event_callback = Some(Box::new(cbk));
        self.notify(SessionEvent::CREATE, None);
        self
    }

    pub fn set_event_interest(&mut self, interest: SessionEvent) {
        self.event_interest = interest;
    }

    /// Backing file path of the top model, if file-backed.
    pub fn file_path(&self) -> Option<&Path> {
        self.top().backing.path()
    }

    // -- Model access ---------------------------------------------------------

    fn top(&self) -> &Model {
        self.models.last().expect("session without a model")
    }

    fn top_mut(&mut self) -> &mut Model {
        self.models.last_mut().expect("session without a model")
    }

    /// Current logical file size in bytes.
    pub fn computed_file_size(&self) -> i64 {
        self.top().computed_size()
    }

    /// Audit segment invariants: every model in the stack is checked, each
    /// independently, for continuity from offset zero, positive lengths, and
    /// change-range containment.
    pub fn check_model(&self) -> bool {
        self.models.iter().all(Model::audit)
    }

    // -- Event plumbing -------------------------------------------------------

    fn notify(&mut self, event: SessionEvent, change: Option<&Change>) {
        if self.event_interest.intersects(event) {
            if let Some(cbk) = self.event_callback.as_mut() {
                cbk(event, change);
            }
        }
    }

    fn dispatch_change_to_viewports(&mut self, change: &Arc<Change>) {
        let paused = self.viewport_callbacks_paused;
        for (index, slot) in self.viewports.iter_mut().enumerate() {
            let Some(viewport) = slot.value.as_mut() else { continue };
            viewport.track_adjustment(change);
            if viewport.affected_by(change) {
                viewport.dirty = true;
                let event = if change.serial() > 0 {
                    ViewportEvent::EDIT
                } else {
                    ViewportEvent::UNDO
                };
                let id = ViewportId { index: index as u32, generation: slot.generation };
                fire_viewport_event(paused, id, viewport, event, Some(change));
            }
        }
    }

    fn broadcast_to_viewports(&mut self, event: ViewportEvent) {
        let paused = self.viewport_callbacks_paused;
        for (index, slot) in self.viewports.iter_mut().enumerate() {
            let Some(viewport) = slot.value.as_mut() else { continue };
            viewport.dirty = true;
            let id = ViewportId { index: index as u32, generation: slot.generation };
            fire_viewport_event(paused, id, viewport, event, None);
        }
    }

    // -- Edit operations ------------------------------------------------------

    /// Insert `bytes` at `offset`. Returns the change serial, or `Ok(0)` as a
    /// silent no-op while changes are paused.
    pub fn insert(&mut self, offset: i64, bytes: &[u8]) -> Result<i64> {
        if self.changes_paused {
            return Ok(0);
        }
        if bytes.is_empty() {
            return Err(EditError::InvalidLength(0));
        }
        let size = self.computed_file_size();
        if offset < 0 || offset > size {
            return Err(EditError::InvalidOffset { offset, size });
        }
        let serial = 1 + self.num_changes();
        let bit = self.claim_transaction_bit();
        self.submit(Arc::new(Change::insert(serial, offset, bytes, bit)))
    }

    /// Overwrite bytes starting at `offset`. The overwritten span is clipped
    /// at end of file; the payload is written in full, growing the file when
    /// it extends past the end.
    pub fn overwrite(&mut self, offset: i64, bytes: &[u8]) -> Result<i64> {
        if self.changes_paused {
            return Ok(0);
        }
        if bytes.is_empty() {
            return Err(EditError::InvalidLength(0));
        }
        let size = self.computed_file_size();
        if offset < 0 || offset > size {
            return Err(EditError::InvalidOffset { offset, size });
        }
        let serial = 1 + self.num_changes();
        let bit = self.claim_transaction_bit();
        self.submit(Arc::new(Change::overwrite(serial, offset, bytes, bit)))
    }

    /// Delete `length` bytes at `offset`, clipped at end of file.
    pub fn delete(&mut self, offset: i64, length: i64) -> Result<i64> {
        if self.changes_paused {
            return Ok(0);
        }
        if length <= 0 {
            return Err(EditError::InvalidLength(length));
        }
        let size = self.computed_file_size();
        if offset < 0 || offset >= size {
            return Err(EditError::InvalidOffset { offset, size });
        }
        let length = length.min(size - offset);
        let serial = 1 + self.num_changes();
        let bit = self.claim_transaction_bit();
        self.submit(Arc::new(Change::delete(serial, offset, length, bit)))
    }

    /// Pick the transaction bit for a new change. Units are maximal runs of
    /// equal bits: a standalone edit flips relative to its predecessor, edits
    /// inside a transaction keep the transaction's bit.
    fn claim_transaction_bit(&mut self) -> bool {
        let previous = self
            .top()
            .changes
            .last()
            .map_or(true, |change| change.transaction_bit());
        match self.transaction_state {
            TransactionState::InProgress => previous,
            TransactionState::Opened => {
                self.transaction_state = TransactionState::InProgress;
                !previous
            }
            TransactionState::None => !previous,
        }
    }

    fn submit(&mut self, change: Arc<Change>) -> Result<i64> {
        if change.serial() < 0 {
            // A previously undone change being redone
            change.negate_serial();
        } else {
            // A fresh edit invalidates everything undone
            for model in &mut self.models {
                model.changes_undone.clear();
            }
        }
        let top = self.top_mut();
        top.changes.push(Arc::clone(&change));
        top.apply_change(&change);
        self.dispatch_change_to_viewports(&change);
        self.notify(SessionEvent::EDIT, Some(&change));
        Ok(change.serial())
    }

    // -- Undo / redo / clear --------------------------------------------------

    /// Undo the latest transaction unit. Serials of undone changes are
    /// negated; returns the (negative) serial of the last change undone, or
    /// `Ok(0)` while changes are paused.
    pub fn undo(&mut self) -> Result<i64> {
        if self.changes_paused {
            return Ok(0);
        }
        if self.top().changes.is_empty() {
            return Err(EditError::NoChangeToUndo);
        }
        let bit = self.top().changes.last().unwrap().transaction_bit();
        let mut undone = Vec::new();
        {
            let top = self.top_mut();
            while top
                .changes
                .last()
                .is_some_and(|change| change.transaction_bit() == bit)
            {
                let change = top.changes.pop().unwrap();
                change.negate_serial();
                top.changes_undone.push(Arc::clone(&change));
                undone.push(change);
            }
            top.rebuild();
        }
        let mut serial = 0;
        for change in &undone {
            self.dispatch_change_to_viewports(change);
            self.notify(SessionEvent::UNDO, Some(change));
            serial = change.serial();
        }
        Ok(serial)
    }

    /// Redo the latest undone transaction unit. Returns the serial of the
    /// last change reapplied, or `Ok(0)` while changes are paused.
    pub fn redo(&mut self) -> Result<i64> {
        if self.changes_paused {
            return Ok(0);
        }
        if self.top().changes_undone.is_empty() {
            return Err(EditError::NoUndoToRedo);
        }
        let bit = self.top().changes_undone.last().unwrap().transaction_bit();
        let mut serial = 0;
        while self
            .top()
            .changes_undone
            .last()
            .is_some_and(|change| change.transaction_bit() == bit)
        {
            let change = self.top_mut().changes_undone.pop().unwrap();
            serial = self.submit(change)?;
        }
        Ok(serial)
    }

    /// Drop all change and undo state in the top model and reset its segment
    /// list to the backing file.
    pub fn clear(&mut self) -> Result<()> {
        let top = self.top_mut();
        top.changes.clear();
        top.reset_segments();
        for model in &mut self.models {
            model.changes_undone.clear();
        }
        self.broadcast_to_viewports(ViewportEvent::CLEAR);
        self.notify(SessionEvent::CLEAR, None);
        Ok(())
    }

    // -- Transactions ---------------------------------------------------------

    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction_state != TransactionState::None {
            return Err(EditError::TransactionAlreadyOpen);
        }
        self.transaction_state = TransactionState::Opened;
        Ok(())
    }

    pub fn end_transaction(&mut self) -> Result<()> {
        if self.transaction_state == TransactionState::None {
            return Err(EditError::NoOpenTransaction);
        }
        self.transaction_state = TransactionState::None;
        Ok(())
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction_state
    }

    // -- Pause flags ----------------------------------------------------------

    /// While paused, every mutating operation silently no-ops (returns 0).
    pub fn pause_changes(&mut self) {
        if !self.changes_paused {
            self.changes_paused = true;
            self.notify(SessionEvent::CHANGES_PAUSED, None);
        }
    }

    pub fn resume_changes(&mut self) {
        if self.changes_paused {
            self.changes_paused = false;
            self.notify(SessionEvent::CHANGES_RESUMED, None);
        }
    }

    pub fn changes_paused(&self) -> bool {
        self.changes_paused
    }

    /// While paused, no viewport events fire; dirty state is still tracked
    /// and can be flushed later with [`Session::notify_changed_viewports`].
    pub fn pause_viewport_callbacks(&mut self) {
        self.viewport_callbacks_paused = true;
    }

    pub fn resume_viewport_callbacks(&mut self) {
        self.viewport_callbacks_paused = false;
    }

    pub fn viewport_callbacks_paused(&self) -> bool {
        self.viewport_callbacks_paused
    }

    /// Fire a `CHANGES` event at every currently dirty viewport. Returns the
    /// number of dirty viewports.
    pub fn notify_changed_viewports(&mut self) -> usize {
        let paused = self.viewport_callbacks_paused;
        let mut count = 0;
        for (index, slot) in self.viewports.iter_mut().enumerate() {
            let Some(viewport) = slot.value.as_mut() else { continue };
            if viewport.dirty {
                let id = ViewportId { index: index as u32, generation: slot.generation };
                fire_viewport_event(paused, id, viewport, ViewportEvent::CHANGES, None);
                count += 1;
            }
        }
        count
    }

    // -- Counters and change access -------------------------------------------

    /// Number of active changes, monotonic across checkpoint creation.
    pub fn num_changes(&self) -> i64 {
        self.top().changes.len() as i64 + self.num_changes_adjustment
    }

    pub fn num_undone_changes(&self) -> i64 {
        self.top().changes_undone.len() as i64
    }

    pub fn num_checkpoints(&self) -> i64 {
        self.models.len() as i64 - 1
    }

    pub fn num_viewports(&self) -> usize {
        self.viewports.iter().filter(|slot| slot.value.is_some()).count()
    }

    pub fn num_search_contexts(&self) -> usize {
        self.searches.iter().filter(|slot| slot.value.is_some()).count()
    }

    /// Number of transaction units on the change stacks of every model.
    pub fn num_change_transactions(&self) -> i64 {
        self.models
            .iter()
            .map(|model| count_bit_runs(&model.changes))
            .sum()
    }

    pub fn num_undone_change_transactions(&self) -> i64 {
        self.models
            .iter()
            .map(|model| count_bit_runs(&model.changes_undone))
            .sum()
    }

    pub fn last_change(&self) -> Option<&Change> {
        self.top().changes.last().map(Arc::as_ref)
    }

    pub fn last_undo(&self) -> Option<&Change> {
        self.top().changes_undone.last().map(Arc::as_ref)
    }

    /// Look up a change by serial: positive serials index the active stack,
    /// negative serials scan the undone stack. Serials frozen in checkpoint
    /// models are not addressable.
    pub fn change_by_serial(&self, serial: i64) -> Option<&Change> {
        if serial > 0 {
            let index = serial - 1 - self.num_changes_adjustment;
            if index < 0 {
                return None;
            }
            self.top().changes.get(index as usize).map(Arc::as_ref)
        } else if serial < 0 {
            self.top()
                .changes_undone
                .iter()
                .rev()
                .find(|change| change.serial() == serial)
                .map(Arc::as_ref)
        } else {
            None
        }
    }

    // -- Projection -----------------------------------------------------------

    /// Materialize up to `length` bytes of the logical file starting at
    /// `offset`. Short only at end of file.
    pub fn segment(&self, offset: i64, length: i64) -> Result<Vec<u8>> {
        if length < 0 {
            return Err(EditError::InvalidLength(length));
        }
        let mut buf = vec![0u8; length as usize];
        let n = self.top().project_into(offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Frequency of each byte value over `[offset, offset + length)`;
    /// `length == 0` profiles through end of file.
    pub fn byte_frequency_profile(&self, offset: i64, length: i64) -> Result<[i64; 256]> {
        let size = self.computed_file_size();
        if offset < 0 || offset > size {
            return Err(EditError::InvalidOffset { offset, size });
        }
        let length = if length == 0 { size - offset } else { length };
        if length < 0 || offset + length > size {
            return Err(EditError::InvalidLength(length));
        }
        let mut profile = [0i64; 256];
        let mut buf = vec![0u8; PROFILE_TILE.min(length).max(1) as usize];
        let mut pos = offset;
        let mut remaining = length;
        while remaining > 0 {
            let amount = (buf.len() as i64).min(remaining) as usize;
            let n = self.top().project_into(pos, &mut buf[..amount])?;
            if n == 0 {
                break;
            }
            for &byte in &buf[..n] {
                profile[byte as usize] += 1;
            }
            pos += n as i64;
            remaining -= n as i64;
        }
        Ok(profile)
    }

    // -- Viewports ------------------------------------------------------------

    pub fn create_viewport(
        &mut self,
        offset: i64,
        capacity: i64,
        is_floating: bool,
    ) -> Result<ViewportId> {
        self.create_viewport_inner(offset, capacity, is_floating, ViewportEvent::empty(), None)
    }

    pub fn create_viewport_with_callback(
        &mut self,
        offset: i64,
        capacity: i64,
        is_floating: bool,
        interest: ViewportEvent,
        cbk: impl FnMut(ViewportId, ViewportEvent, Option<&Change>) + 'static,
    ) -> Result<ViewportId> {
        self.create_viewport_inner(offset, capacity, is_floating, interest, Some(Box::new(cbk)))
    }

    fn create_viewport_inner(
        &mut self,
        offset: i64,
        capacity: i64,
        is_floating: bool,
        interest: ViewportEvent,
        callback: Option<ViewportEventCallback>,
    ) -> Result<ViewportId> {
        if capacity <= 0 || capacity > VIEWPORT_CAPACITY_LIMIT {
            return Err(EditError::CapacityOutOfRange(capacity));
        }
        if offset < 0 {
            return Err(EditError::InvalidOffset { offset, size: self.computed_file_size() });
        }
        let mut viewport = Viewport::new(offset, capacity, is_floating);
        viewport.event_interest = interest;
        viewport.callback = callback;
        let (index, generation) = allocate(&mut self.viewports, viewport);
        let id = ViewportId { index, generation };
        let paused = self.viewport_callbacks_paused;
        let viewport = self.viewports[index as usize].value.as_mut().unwrap();
        fire_viewport_event(paused, id, viewport, ViewportEvent::CREATE, None);
        self.notify(SessionEvent::CREATE_VIEWPORT, None);
        Ok(id)
    }

    pub fn destroy_viewport(&mut self, id: ViewportId) -> Result<()> {
        let slot = self
            .viewports
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(EditError::StaleHandle)?;
        slot.value.take().ok_or(EditError::StaleHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.notify(SessionEvent::DESTROY_VIEWPORT, None);
        Ok(())
    }

    /// Change a viewport's window. A call with identical settings is a
    /// no-op; otherwise the buffer is reallocated, the floating adjustment
    /// reset, and the viewport marked dirty.
    pub fn modify_viewport(
        &mut self,
        id: ViewportId,
        offset: i64,
        capacity: i64,
        is_floating: bool,
    ) -> Result<()> {
        if capacity <= 0 || capacity > VIEWPORT_CAPACITY_LIMIT {
            return Err(EditError::CapacityOutOfRange(capacity));
        }
        let paused = self.viewport_callbacks_paused;
        let viewport = self.viewport_mut(id)?;
        if viewport.offset == offset
            && viewport.capacity == capacity
            && viewport.is_floating == is_floating
        {
            return Ok(());
        }
        viewport.offset = offset;
        viewport.capacity = capacity;
        viewport.is_floating = is_floating;
        viewport.offset_adjustment = 0;
        viewport.dirty = true;
        viewport.data = vec![0; capacity as usize];
        viewport.length = 0;
        fire_viewport_event(paused, id, viewport, ViewportEvent::MODIFY, None);
        Ok(())
    }

    /// The viewport's bytes, re-projected first if an edit dirtied them.
    pub fn viewport_data(&mut self, id: ViewportId) -> Result<&[u8]> {
        self.viewport(id)?;
        let model = self.models.last().expect("session without a model");
        let viewport = self.viewports[id.index as usize].value.as_mut().unwrap();
        if viewport.dirty {
            let offset = viewport.effective_offset();
            let n = model.project_into(offset, &mut viewport.data)?;
            viewport.length = n as i64;
            viewport.dirty = false;
        }
        Ok(&viewport.data[..viewport.length as usize])
    }

    /// Current effective offset (base plus floating adjustment).
    pub fn viewport_offset(&self, id: ViewportId) -> Result<i64> {
        Ok(self.viewport(id)?.effective_offset())
    }

    /// Bytes the viewport reports: the cached length, or the clamped
    /// projection length while dirty.
    pub fn viewport_length(&self, id: ViewportId) -> Result<i64> {
        let viewport = self.viewport(id)?;
        Ok(if viewport.dirty {
            viewport.computed_length(self.computed_file_size())
        } else {
            viewport.length
        })
    }

    pub fn viewport_capacity(&self, id: ViewportId) -> Result<i64> {
        Ok(self.viewport(id)?.capacity)
    }

    pub fn viewport_is_floating(&self, id: ViewportId) -> Result<bool> {
        Ok(self.viewport(id)?.is_floating)
    }

    /// Whether the viewport's cached buffer is stale.
    pub fn viewport_has_changes(&self, id: ViewportId) -> Result<bool> {
        Ok(self.viewport(id)?.dirty)
    }

    /// Fire `event` at one viewport's callback, subject to its interest mask
    /// and the session-wide pause flag.
    pub fn notify_viewport(&mut self, id: ViewportId, event: ViewportEvent) -> Result<()> {
        let paused = self.viewport_callbacks_paused;
        let viewport = self.viewport_mut(id)?;
        fire_viewport_event(paused, id, viewport, event, None);
        Ok(())
    }

    fn viewport(&self, id: ViewportId) -> Result<&Viewport> {
        self.viewports
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(EditError::StaleHandle)
    }

    fn viewport_mut(&mut self, id: ViewportId) -> Result<&mut Viewport> {
        self.viewports
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or(EditError::StaleHandle)
    }

    // -- Search ---------------------------------------------------------------

    /// Create a search context over `[session_offset, session_offset +
    /// session_length)`; a zero `session_length` searches through end of
    /// file. Case-insensitive matching folds ASCII.
    pub fn create_search_context(
        &mut self,
        pattern: &[u8],
        session_offset: i64,
        session_length: i64,
        case_insensitive: bool,
    ) -> Result<SearchId> {
        let pattern_length = pattern.len() as i64;
        if pattern_length < 1 {
            return Err(EditError::InvalidLength(pattern_length));
        }
        if pattern_length > SEARCH_PATTERN_LENGTH_LIMIT {
            return Err(EditError::PatternTooLong(pattern_length));
        }
        let size = self.computed_file_size();
        if session_offset < 0 {
            return Err(EditError::InvalidOffset { offset: session_offset, size });
        }
        if session_length < 0 {
            return Err(EditError::InvalidLength(session_length));
        }
        let range = if session_length != 0 {
            session_length
        } else {
            size - session_offset
        };
        if pattern_length > range {
            return Err(EditError::PatternExceedsRange);
        }
        let sentinel = if session_length != 0 { session_length } else { size };
        let context = SearchContext::new(
            pattern,
            session_offset,
            session_length,
            case_insensitive,
            sentinel,
        );
        let (index, generation) = allocate(&mut self.searches, context);
        Ok(SearchId { index, generation })
    }

    /// Find the next match, resuming `advance_by` bytes past the previous
    /// one. Returns false when the range is exhausted; the next call starts
    /// over from the session offset.
    pub fn next_match(&mut self, id: SearchId, advance_by: i64) -> Result<bool> {
        let model = self.models.last().expect("session without a model");
        let context = self
            .searches
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or(EditError::StaleHandle)?;
        context.next_match(model, advance_by)
    }

    pub fn match_offset(&self, id: SearchId) -> Result<i64> {
        Ok(self.search(id)?.match_offset())
    }

    pub fn match_length(&self, id: SearchId) -> Result<i64> {
        Ok(self.search(id)?.pattern_length())
    }

    pub fn destroy_search_context(&mut self, id: SearchId) -> Result<()> {
        let slot = self
            .searches
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(EditError::StaleHandle)?;
        slot.value.take().ok_or(EditError::StaleHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    fn search(&self, id: SearchId) -> Result<&SearchContext> {
        self.searches
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(EditError::StaleHandle)
    }

    // -- Checkpoints, transforms, save ----------------------------------------

    /// Serialize the current logical file into a snapshot under `dir` and
    /// push a fresh model backed by it. Bounds replay cost after long
    /// histories and gives byte transforms a file of their own to rewrite.
    pub fn create_checkpoint(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut snapshot = tempfile::Builder::new()
            .prefix(".scalpel-chk.")
            .tempfile_in(dir)?;
        {
            let mut out = std::io::BufWriter::new(snapshot.as_file_mut());
            self.top().write_to(&mut out)?;
            out.flush()?;
        }
        snapshot.as_file().sync_all()?;
        debug!(path = %snapshot.path().display(), "created checkpoint");
        self.num_changes_adjustment = self.num_changes();
        self.models.push(Model::new(Backing::checkpoint(snapshot)?));
        self.notify(SessionEvent::CREATE_CHECKPOINT, None);
        Ok(())
    }

    /// Pop the top checkpoint model and delete its snapshot file.
    pub fn destroy_last_checkpoint(&mut self) -> Result<()> {
        if self.models.len() < 2 {
            return Err(EditError::CheckpointMissing);
        }
        let popped = self.models.pop().unwrap();
        self.num_changes_adjustment -= popped.changes.len() as i64;
        drop(popped);
        self.notify(SessionEvent::DESTROY_CHECKPOINT, None);
        Ok(())
    }

    /// Checkpoint, then rewrite the new backing file through a per-byte
    /// transform over `[offset, offset + length)` (`length == 0` meaning
    /// through end of file). All viewports are invalidated.
    pub fn apply_byte_transform<F>(
        &mut self,
        offset: i64,
        length: i64,
        checkpoint_dir: impl AsRef<Path>,
        transform: F,
    ) -> Result<()>
    where
        F: FnMut(u8) -> u8,
    {
        self.create_checkpoint(checkpoint_dir)?;
        self.top_mut().backing.transform_and_swap(offset, length, transform)?;
        self.top_mut().reset_segments();
        self.broadcast_to_viewports(ViewportEvent::TRANSFORM);
        self.notify(SessionEvent::TRANSFORM, None);
        Ok(())
    }

    /// Stream the logical file to `path` through a temp file and an atomic
    /// rename. When the target exists and `overwrite` is false, a sibling
    /// `name-N.ext` (N = 1..99) is chosen instead. Returns the path actually
    /// written.
    pub fn save(&mut self, path: impl AsRef<Path>, overwrite: bool) -> Result<PathBuf> {
        let target = path.as_ref();
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut temp = tempfile::Builder::new().prefix(".scalpel.").tempfile_in(&dir)?;
        {
            let mut out = std::io::BufWriter::new(temp.as_file_mut());
            self.top().write_to(&mut out)?;
            out.flush()?;
        }
        temp.as_file().sync_all()?;
        let actual = if target.exists() && !overwrite {
            available_filename(target)?
        } else {
            target.to_path_buf()
        };
        temp.persist(&actual).map_err(|e| EditError::Io(e.error))?;
        debug!(path = %actual.display(), "saved session");
        self.notify(SessionEvent::SAVE, None);
        Ok(actual)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction units are maximal runs of changes sharing a transaction bit.
fn count_bit_runs(changes: &[Arc<Change>]) -> i64 {
    let mut runs = 0i64;
    let mut current = false;
    for change in changes {
        if runs == 0 || change.transaction_bit() != current {
            current = change.transaction_bit();
            runs += 1;
        }
    }
    runs
}

/// First `name-N.ext` sibling (N = 1..99) that does not exist yet.
fn available_filename(target: &Path) -> Result<PathBuf> {
    let dir = target.parent().unwrap_or_else(|| Path::new(""));
    let stem = target
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    let extension = target.extension();
    for n in 1..=99 {
        let mut name = stem.clone();
        name.push(format!("-{n}"));
        if let Some(ext) = extension {
            name.push(".");
            name.push(ext);
        }
        let candidate = dir.join(&name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(EditError::NoAvailableFilename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    // -- Edit basics ----------------------------------------------------------

    #[test]
    fn test_empty_session_rejects_out_of_range() {
        let mut session = Session::new();
        assert_eq!(session.computed_file_size(), 0);
        assert!(session.insert(1, b"x").is_err());
        assert!(session.delete(0, 1).is_err());
        assert_eq!(session.insert(0, b"x").unwrap(), 1);
    }

    #[test]
    fn test_zero_length_edits_rejected() {
        let mut session = Session::new();
        session.insert(0, b"abc").unwrap();
        assert!(session.insert(0, b"").is_err());
        assert!(session.overwrite(0, b"").is_err());
        assert!(session.delete(0, 0).is_err());
        assert!(session.delete(0, -1).is_err());
    }

    #[test]
    fn test_serials_are_contiguous() {
        let mut session = Session::new();
        assert_eq!(session.insert(0, b"a").unwrap(), 1);
        assert_eq!(session.insert(0, b"b").unwrap(), 2);
        assert_eq!(session.delete(0, 1).unwrap(), 3);
        assert_eq!(session.num_changes(), 3);
        assert_eq!(session.last_change().unwrap().serial(), 3);
    }

    #[test]
    fn test_delete_clips_at_eof() {
        let mut session = Session::new();
        session.insert(0, b"0123456789").unwrap();
        session.delete(6, 1000).unwrap();
        assert_eq!(session.computed_file_size(), 6);
        assert_eq!(session.last_change().unwrap().length(), 4);
    }

    // -- Pause semantics ------------------------------------------------------

    #[test]
    fn test_paused_session_noops() {
        let mut session = Session::new();
        session.insert(0, b"abc").unwrap();
        session.pause_changes();
        assert_eq!(session.insert(0, b"x").unwrap(), 0);
        assert_eq!(session.delete(0, 1).unwrap(), 0);
        assert_eq!(session.undo().unwrap(), 0);
        assert_eq!(session.computed_file_size(), 3);
        session.resume_changes();
        assert_eq!(session.insert(0, b"x").unwrap(), 2);
    }

    // -- Undo / redo ----------------------------------------------------------

    #[test]
    fn test_undo_negates_serial_and_moves() {
        let mut session = Session::new();
        session.insert(0, b"hello").unwrap();
        let serial = session.undo().unwrap();
        assert_eq!(serial, -1);
        assert_eq!(session.num_changes(), 0);
        assert_eq!(session.num_undone_changes(), 1);
        assert_eq!(session.last_undo().unwrap().serial(), -1);
        assert_eq!(session.computed_file_size(), 0);
    }

    #[test]
    fn test_redo_restores() {
        let mut session = Session::new();
        session.insert(0, b"hello").unwrap();
        session.undo().unwrap();
        assert_eq!(session.redo().unwrap(), 1);
        assert_eq!(session.segment(0, 5).unwrap(), b"hello");
        assert_eq!(session.num_undone_changes(), 0);
    }

    #[test]
    fn test_new_edit_invalidates_redo() {
        let mut session = Session::new();
        session.insert(0, b"aa").unwrap();
        session.insert(2, b"bb").unwrap();
        session.undo().unwrap();
        assert_eq!(session.num_undone_changes(), 1);
        session.insert(0, b"cc").unwrap();
        assert_eq!(session.num_undone_changes(), 0);
        assert!(session.redo().is_err());
    }

    #[test]
    fn test_undo_on_empty_stack_errors() {
        let mut session = Session::new();
        assert!(matches!(session.undo(), Err(EditError::NoChangeToUndo)));
        assert!(matches!(session.redo(), Err(EditError::NoUndoToRedo)));
    }

    // -- Transactions ---------------------------------------------------------

    #[test]
    fn test_transaction_is_one_undo_unit() {
        let mut session = Session::new();
        session.insert(0, b"base").unwrap();
        session.begin_transaction().unwrap();
        session.insert(4, b"-1-").unwrap();
        session.insert(7, b"-2-").unwrap();
        session.insert(10, b"-3-").unwrap();
        session.end_transaction().unwrap();
        assert_eq!(session.computed_file_size(), 13);
        assert_eq!(session.num_change_transactions(), 2);

        session.undo().unwrap();
        assert_eq!(session.segment(0, 16).unwrap(), b"base");
        assert_eq!(session.num_undone_changes(), 3);

        session.redo().unwrap();
        assert_eq!(session.segment(0, 16).unwrap(), b"base-1--2--3-");
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let mut session = Session::new();
        session.begin_transaction().unwrap();
        assert!(matches!(
            session.begin_transaction(),
            Err(EditError::TransactionAlreadyOpen)
        ));
        session.end_transaction().unwrap();
        assert!(matches!(
            session.end_transaction(),
            Err(EditError::NoOpenTransaction)
        ));
    }

    #[test]
    fn test_transaction_state_progression() {
        let mut session = Session::new();
        assert_eq!(session.transaction_state(), TransactionState::None);
        session.begin_transaction().unwrap();
        assert_eq!(session.transaction_state(), TransactionState::Opened);
        session.insert(0, b"x").unwrap();
        assert_eq!(session.transaction_state(), TransactionState::InProgress);
        session.end_transaction().unwrap();
        assert_eq!(session.transaction_state(), TransactionState::None);
    }

    // -- Events ---------------------------------------------------------------

    #[test]
    fn test_session_events_respect_interest() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut session = Session::new().with_event_callback(
            SessionEvent::CREATE | SessionEvent::EDIT,
            move |event, _| sink.borrow_mut().push(event),
        );
        session.insert(0, b"x").unwrap();
        session.undo().unwrap(); // UNDO not in the interest mask
        assert_eq!(
            *seen.borrow(),
            vec![SessionEvent::CREATE, SessionEvent::EDIT]
        );
    }

    #[test]
    fn test_change_by_serial() {
        let mut session = Session::new();
        session.insert(0, b"aa").unwrap();
        session.insert(0, b"bb").unwrap();
        assert_eq!(session.change_by_serial(2).unwrap().bytes(), b"bb");
        assert!(session.change_by_serial(3).is_none());
        session.undo().unwrap();
        assert_eq!(session.change_by_serial(-2).unwrap().bytes(), b"bb");
    }

    // -- Viewport handles -----------------------------------------------------

    #[test]
    fn test_viewport_lifecycle() {
        let mut session = Session::new();
        session.insert(0, b"0123456789").unwrap();
        let vp = session.create_viewport(2, 4, false).unwrap();
        assert_eq!(session.num_viewports(), 1);
        assert_eq!(session.viewport_data(vp).unwrap(), b"2345");
        assert!(!session.viewport_has_changes(vp).unwrap());

        session.destroy_viewport(vp).unwrap();
        assert_eq!(session.num_viewports(), 0);
        assert!(matches!(session.viewport_data(vp), Err(EditError::StaleHandle)));
    }

    #[test]
    fn test_viewport_capacity_bounds() {
        let mut session = Session::new();
        assert!(session.create_viewport(0, 0, false).is_err());
        assert!(session
            .create_viewport(0, crate::VIEWPORT_CAPACITY_LIMIT + 1, false)
            .is_err());
        assert!(session
            .create_viewport(0, crate::VIEWPORT_CAPACITY_LIMIT, false)
            .is_ok());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut session = Session::new();
        session.insert(0, b"abcdef").unwrap();
        let old = session.create_viewport(0, 4, false).unwrap();
        session.destroy_viewport(old).unwrap();
        let new = session.create_viewport(2, 4, false).unwrap();
        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);
        assert!(session.viewport_data(old).is_err());
        assert_eq!(session.viewport_data(new).unwrap(), b"cdef");
    }

    // -- Profile --------------------------------------------------------------

    #[test]
    fn test_byte_frequency_profile() {
        let mut session = Session::new();
        session.insert(0, b"aabbbc").unwrap();
        let profile = session.byte_frequency_profile(0, 0).unwrap();
        assert_eq!(profile[b'a' as usize], 2);
        assert_eq!(profile[b'b' as usize], 3);
        assert_eq!(profile[b'c' as usize], 1);
        assert_eq!(profile.iter().sum::<i64>(), 6);

        let partial = session.byte_frequency_profile(2, 3).unwrap();
        assert_eq!(partial[b'b' as usize], 3);
        assert_eq!(partial.iter().sum::<i64>(), 3);
    }

    // -- Checkpoints ----------------------------------------------------------

    #[test]
    fn test_checkpoint_keeps_num_changes_monotonic() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut session = Session::new();
        session.insert(0, b"one").unwrap();
        session.insert(3, b"two").unwrap();
        assert_eq!(session.num_changes(), 2);

        session.create_checkpoint(dir.path()).unwrap();
        assert_eq!(session.num_checkpoints(), 1);
        assert_eq!(session.num_changes(), 2);

        assert_eq!(session.insert(6, b"three").unwrap(), 3);
        assert_eq!(session.num_changes(), 3);
        assert_eq!(session.segment(0, 16).unwrap(), b"onetwothree");
    }

    #[test]
    fn test_checkpoint_destroy_discards_later_edits() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut session = Session::new();
        session.insert(0, b"kept").unwrap();
        session.create_checkpoint(dir.path()).unwrap();
        session.insert(4, b" dropped").unwrap();
        assert_eq!(session.segment(0, 16).unwrap(), b"kept dropped");

        session.destroy_last_checkpoint().unwrap();
        assert_eq!(session.num_checkpoints(), 0);
        assert_eq!(session.segment(0, 16).unwrap(), b"kept");
        assert!(matches!(
            session.destroy_last_checkpoint(),
            Err(EditError::CheckpointMissing)
        ));
    }

    #[test]
    fn test_edits_on_checkpoint_model() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut session = Session::new();
        session.insert(0, b"0123456789").unwrap();
        session.create_checkpoint(dir.path()).unwrap();

        // The checkpoint model starts as a single READ over the snapshot
        session.delete(0, 2).unwrap();
        session.insert(0, b"xx").unwrap();
        assert_eq!(session.segment(0, 10).unwrap(), b"xx23456789");
        assert!(session.check_model());

        session.undo().unwrap();
        session.undo().unwrap();
        assert_eq!(session.segment(0, 10).unwrap(), b"0123456789");
    }

    // -- Save helpers ---------------------------------------------------------

    #[test]
    fn test_available_filename_appends_counter() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("out.bin");
        std::fs::write(&target, b"occupied").unwrap();
        let next = available_filename(&target).unwrap();
        assert_eq!(next, dir.path().join("out-1.bin"));
        std::fs::write(&next, b"also occupied").unwrap();
        assert_eq!(available_filename(&target).unwrap(), dir.path().join("out-2.bin"));
    }

    #[test]
    fn test_count_bit_runs() {
        let changes: Vec<Arc<Change>> = [false, true, true, false, true]
            .iter()
            .enumerate()
            .map(|(i, &bit)| Arc::new(Change::insert(i as i64 + 1, 0, b"x", bit)))
            .collect();
        assert_eq!(count_bit_runs(&changes), 4);
        assert_eq!(count_bit_runs(&[]), 0);
    }
}
