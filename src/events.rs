//! Session and viewport event masks.
//!
//! Events carry power-of-two values so an interest mask is a bitwise OR of
//! the events a listener wants. The same type doubles as the single-event
//! value handed to callbacks.

use bitflags::bitflags;

bitflags! {
    /// Events observable on a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionEvent: u32 {
        const CREATE             = 1;
        const EDIT               = 1 << 1;
        const UNDO               = 1 << 2;
        const CLEAR              = 1 << 3;
        const TRANSFORM          = 1 << 4;
        const CREATE_CHECKPOINT  = 1 << 5;
        const DESTROY_CHECKPOINT = 1 << 6;
        const SAVE               = 1 << 7;
        const CHANGES_PAUSED     = 1 << 8;
        const CHANGES_RESUMED    = 1 << 9;
        const CREATE_VIEWPORT    = 1 << 10;
        const DESTROY_VIEWPORT   = 1 << 11;
    }
}

bitflags! {
    /// Events observable on a viewport.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ViewportEvent: u32 {
        const CREATE    = 1;
        const EDIT      = 1 << 1;
        const UNDO      = 1 << 2;
        const CLEAR     = 1 << 3;
        const TRANSFORM = 1 << 4;
        const MODIFY    = 1 << 5;
        const CHANGES   = 1 << 6;
    }
}
