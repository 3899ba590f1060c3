//! Pointer input capture and stroke building.
//!
//! [`StrokeBuilder`] turns raw pointer events into replica operations:
//!
//! ```text
//! Idle ──pointer-down (primary)──▶ Drawing ──up / leave / cancel──▶ Idle
//!                                   │  ▲
//!                                   └──┘ pointer-move (thresholded)
//! ```

use kurbo::{Point, Size};
use serde::{Deserialize, Serialize};

use crate::ops::Operation;
use crate::stroke::{Brush, Stroke, StrokeId};

/// Samples closer than this to the last recorded point are dropped.
pub const DEFAULT_MIN_POINT_DISTANCE_PX: f64 = 2.0;

/// Mouse button identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Pointer event in canvas-relative pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PointerEvent {
    Down {
        pointer_id: u32,
        position: Point,
        button: MouseButton,
    },
    Move {
        pointer_id: u32,
        position: Point,
    },
    Up {
        pointer_id: u32,
        position: Point,
    },
    Leave {
        pointer_id: u32,
    },
    Cancel {
        pointer_id: u32,
    },
}

/// Pointer capture change requested from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRequest {
    Acquire(u32),
    Release(u32),
}

/// Result of feeding one pointer event to the builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputOutput {
    /// Operation to apply to the local replica.
    pub operation: Option<Operation>,
    /// Pointer capture change for the host.
    pub capture: Option<CaptureRequest>,
}

#[derive(Debug, Clone)]
enum BuilderState {
    Idle,
    Drawing {
        pointer_id: u32,
        stroke_id: StrokeId,
        /// Last recorded position in pixels.
        last: Point,
        next_seq: u32,
    },
}

/// Converts pointer input into normalized stroke operations.
#[derive(Debug, Clone)]
pub struct StrokeBuilder {
    state: BuilderState,
    brush: Brush,
    min_distance: f64,
}

impl Default for StrokeBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_POINT_DISTANCE_PX)
    }
}

impl StrokeBuilder {
    /// Create a builder with the given sample threshold in pixels.
    pub fn new(min_distance: f64) -> Self {
        Self {
            state: BuilderState::Idle,
            brush: Brush::default(),
            min_distance,
        }
    }

    /// Brush used for the next stroke.
    pub fn brush(&self) -> &Brush {
        &self.brush
    }

    /// Set the brush; takes effect on the next pointer-down.
    pub fn set_brush(&mut self, brush: Brush) {
        self.brush = brush;
    }

    pub fn is_drawing(&self) -> bool {
        matches!(self.state, BuilderState::Drawing { .. })
    }

    /// Id of the stroke currently being drawn.
    pub fn live_stroke(&self) -> Option<&str> {
        match &self.state {
            BuilderState::Drawing { stroke_id, .. } => Some(stroke_id),
            BuilderState::Idle => None,
        }
    }

    /// Process a pointer event for a canvas of `viewport` pixels.
    pub fn handle(&mut self, event: &PointerEvent, viewport: Size) -> InputOutput {
        if viewport.width <= 0.0 || viewport.height <= 0.0 {
            log::debug!("Ignoring pointer input on empty viewport");
            return InputOutput::default();
        }

        match event {
            PointerEvent::Down {
                pointer_id,
                position,
                button: MouseButton::Left,
            } => {
                if self.is_drawing() {
                    return InputOutput::default();
                }
                let stroke = Stroke::new(&self.brush, normalize(*position, viewport));
                self.state = BuilderState::Drawing {
                    pointer_id: *pointer_id,
                    stroke_id: stroke.id.clone(),
                    last: *position,
                    next_seq: 1,
                };
                InputOutput {
                    operation: Some(Operation::CreateStroke { stroke }),
                    capture: Some(CaptureRequest::Acquire(*pointer_id)),
                }
            }
            PointerEvent::Move {
                pointer_id,
                position,
            } => {
                let BuilderState::Drawing {
                    pointer_id: active,
                    stroke_id,
                    last,
                    next_seq,
                } = &mut self.state
                else {
                    return InputOutput::default();
                };
                if *pointer_id != *active || position.distance(*last) < self.min_distance {
                    return InputOutput::default();
                }
                let seq = *next_seq;
                *next_seq += 1;
                *last = *position;
                InputOutput {
                    operation: Some(Operation::append(
                        stroke_id.clone(),
                        0,
                        seq,
                        normalize(*position, viewport),
                    )),
                    capture: None,
                }
            }
            PointerEvent::Up { pointer_id, .. }
            | PointerEvent::Leave { pointer_id }
            | PointerEvent::Cancel { pointer_id } => match self.state {
                BuilderState::Drawing {
                    pointer_id: active, ..
                } if active == *pointer_id => {
                    self.state = BuilderState::Idle;
                    InputOutput {
                        operation: None,
                        capture: Some(CaptureRequest::Release(active)),
                    }
                }
                _ => InputOutput::default(),
            },
            PointerEvent::Down { .. } => InputOutput::default(),
        }
    }

    /// Abandon the live stroke (e.g. when leaving a room).
    pub fn reset(&mut self) -> Option<CaptureRequest> {
        match std::mem::replace(&mut self.state, BuilderState::Idle) {
            BuilderState::Drawing { pointer_id, .. } => Some(CaptureRequest::Release(pointer_id)),
            BuilderState::Idle => None,
        }
    }
}

/// Map a pixel position to normalized canvas coordinates. Positions outside
/// the viewport (a captured pointer dragged past the edge) land on the edge.
pub fn normalize(position: Point, viewport: Size) -> Point {
    Point::new(
        (position.x / viewport.width).clamp(0.0, 1.0),
        (position.y / viewport.height).clamp(0.0, 1.0),
    )
}
