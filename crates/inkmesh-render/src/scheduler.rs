//! Redraw coalescing.
//!
//! Any number of redraw requests between two frames produce exactly one frame.
//! A [`RedrawHandle`] can be moved into a replica change listener so document
//! updates mark the frame dirty without touching the renderer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct Shared {
    pending: AtomicBool,
    coalesced: AtomicU64,
}

/// Cloneable, thread-safe way to request a redraw.
#[derive(Debug, Clone)]
pub struct RedrawHandle {
    shared: Arc<Shared>,
}

impl RedrawHandle {
    /// Mark the frame dirty. Returns true if this request needs a new frame
    /// scheduled, false if one is already pending.
    pub fn request(&self) -> bool {
        let first = !self.shared.pending.swap(true, Ordering::AcqRel);
        if !first {
            self.shared.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        first
    }
}

/// Collapses redraw requests into at most one pending frame.
#[derive(Debug, Default)]
pub struct FrameScheduler {
    shared: Arc<Shared>,
    frames: u64,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for requesting redraws from elsewhere.
    pub fn handle(&self) -> RedrawHandle {
        RedrawHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// See [`RedrawHandle::request`].
    pub fn request_redraw(&self) -> bool {
        self.handle().request()
    }

    /// Whether a frame is waiting to be drawn.
    pub fn is_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Take the pending request. Returns false if nothing needs drawing.
    pub fn begin_frame(&mut self) -> bool {
        if self.shared.pending.swap(false, Ordering::AcqRel) {
            self.frames += 1;
            true
        } else {
            false
        }
    }

    /// Frames started so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Requests absorbed by an already-pending frame.
    pub fn coalesced_count(&self) -> u64 {
        self.shared.coalesced.load(Ordering::Relaxed)
    }
}
