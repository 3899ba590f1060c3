//! Freehand strokes drawn on the shared canvas.

use kurbo::Point;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ops::PeerId;

/// Stroke identifier (UUID string, globally unique across peers).
pub type StrokeId = String;

/// Default stroke color.
pub const DEFAULT_COLOR: &str = "#000000";
/// Default brush size in CSS pixels.
pub const DEFAULT_SIZE: f64 = 4.0;

/// Drawing tool a stroke was made with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    /// Paints color on top of existing pixels.
    #[default]
    Pen,
    /// Removes previously drawn pixels.
    Eraser,
}

impl Tool {
    /// Parse a tool from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pen" => Some(Tool::Pen),
            "eraser" => Some(Tool::Eraser),
            _ => None,
        }
    }
}

/// Brush properties applied to new strokes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brush {
    /// CSS color string.
    pub color: String,
    /// Line width in CSS pixels.
    pub size: f64,
    pub tool: Tool,
}

impl Default for Brush {
    fn default() -> Self {
        Self {
            color: DEFAULT_COLOR.to_string(),
            size: DEFAULT_SIZE,
            tool: Tool::Pen,
        }
    }
}

/// One continuous pen or eraser gesture.
///
/// Points are normalized to `[0, 1]` of the canvas size. Only the author
/// appends points; `epoch`, `clock` and `author` are stamped by the replica
/// that created the stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub id: StrokeId,
    pub color: String,
    pub size: f64,
    pub tool: Tool,
    /// Points in sequence order.
    pub points: Vec<Point>,
    /// Clear epoch the stroke was created in.
    #[serde(default)]
    pub epoch: u64,
    /// Lamport timestamp at creation.
    #[serde(default)]
    pub clock: u64,
    /// Creating peer.
    #[serde(default)]
    pub author: PeerId,
}

impl Stroke {
    /// Create a stroke with a fresh id and a single point.
    pub fn new(brush: &Brush, first: Point) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), brush, vec![first])
    }

    /// Create a stroke with an explicit id.
    pub fn with_id(id: impl Into<StrokeId>, brush: &Brush, points: Vec<Point>) -> Self {
        Self {
            id: id.into(),
            color: brush.color.clone(),
            size: brush.size,
            tool: brush.tool,
            points,
            epoch: 0,
            clock: 0,
            author: PeerId::new(),
        }
    }

    /// Brush the stroke was drawn with.
    pub fn brush(&self) -> Brush {
        Brush {
            color: self.color.clone(),
            size: self.size,
            tool: self.tool,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_eraser(&self) -> bool {
        self.tool == Tool::Eraser
    }
}
