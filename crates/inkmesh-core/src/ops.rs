//! Operations on the shared drawing log.
//!
//! Operations travel between peers as JSON objects tagged by `"op"`:
//! ```json
//! { "op": "create_stroke", "stroke": { "id": "…", "color": "#000", "size": 4, "tool": "pen", "points": [{ "x": 0.1, "y": 0.1 }] } }
//! { "op": "append_point", "stroke_id": "…", "epoch": 0, "seq": 1, "point": { "x": 0.2, "y": 0.2 } }
//! { "op": "clear", "epoch": 1 }
//! ```
//!
//! Remote operations are decoded with [`Operation::from_value`], which drops
//! corrupt points one at a time instead of rejecting the whole stroke.

use kurbo::Point;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stroke::{Stroke, StrokeId, Tool};

/// Peer identifier (UUID string).
pub type PeerId = String;

/// A single mutation of the shared document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Start a new stroke. Initial points take sequence numbers `0..n`.
    CreateStroke { stroke: Stroke },
    /// Append one point to a live stroke.
    AppendPoint {
        stroke_id: StrokeId,
        /// Epoch of the stroke the point belongs to.
        epoch: u64,
        /// Per-stroke sequence number.
        seq: u32,
        point: Point,
    },
    /// Logically empty the document up to `epoch`.
    Clear { epoch: u64 },
}

impl Operation {
    /// Build an append operation.
    pub fn append(stroke_id: impl Into<StrokeId>, epoch: u64, seq: u32, point: Point) -> Self {
        Operation::AppendPoint {
            stroke_id: stroke_id.into(),
            epoch,
            seq,
            point,
        }
    }

    /// Id of the stroke this operation touches, if any.
    pub fn stroke_id(&self) -> Option<&str> {
        match self {
            Operation::CreateStroke { stroke } => Some(&stroke.id),
            Operation::AppendPoint { stroke_id, .. } => Some(stroke_id),
            Operation::Clear { .. } => None,
        }
    }

    /// Encode to a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Leniently decode a remote operation.
    ///
    /// Returns `None` when the operation itself is unusable (unknown tag,
    /// missing stroke id or brush fields). Individual malformed points inside
    /// a `create_stroke` are skipped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        match obj.get("op")?.as_str()? {
            "create_stroke" => decode_create(obj.get("stroke")?.as_object()?),
            "append_point" => {
                let stroke_id = non_empty_str(obj.get("stroke_id"))?;
                let seq = u32::try_from(obj.get("seq")?.as_u64()?).ok()?;
                let epoch = obj.get("epoch").and_then(Value::as_u64).unwrap_or(0);
                let point = decode_point(obj.get("point")?)?;
                Some(Operation::append(stroke_id, epoch, seq, point))
            }
            "clear" => Some(Operation::Clear {
                epoch: obj.get("epoch")?.as_u64()?,
            }),
            other => {
                log::debug!("Ignoring unknown operation kind: {}", other);
                None
            }
        }
    }
}

fn decode_create(stroke: &Map<String, Value>) -> Option<Operation> {
    let id = non_empty_str(stroke.get("id"))?;
    let color = stroke.get("color")?.as_str()?.to_string();
    let size = stroke.get("size")?.as_f64().filter(|s| s.is_finite() && *s > 0.0)?;
    let tool = Tool::from_name(stroke.get("tool")?.as_str()?)?;

    let raw_points = stroke
        .get("points")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let points: Vec<Point> = raw_points.iter().filter_map(decode_point).collect();
    if points.len() < raw_points.len() {
        log::debug!(
            "Dropped {} malformed point(s) from stroke {}",
            raw_points.len() - points.len(),
            id
        );
    }

    Some(Operation::CreateStroke {
        stroke: Stroke {
            id,
            color,
            size,
            tool,
            points,
            epoch: stroke.get("epoch").and_then(Value::as_u64).unwrap_or(0),
            clock: stroke.get("clock").and_then(Value::as_u64).unwrap_or(0),
            author: stroke
                .get("author")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Decode a `{ x, y }` point with finite numeric coordinates.
pub fn decode_point(value: &Value) -> Option<Point> {
    let obj = value.as_object()?;
    let x = obj.get("x")?.as_f64()?;
    let y = obj.get("y")?.as_f64()?;
    (x.is_finite() && y.is_finite()).then(|| Point::new(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke::Brush;
    use serde_json::json;

    #[test]
    fn test_operation_wire_tags() {
        let op = Operation::Clear { epoch: 3 };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"op\":\"clear\""));

        let op = Operation::append("s1", 0, 1, Point::new(0.2, 0.2));
        let value = op.to_value();
        assert_eq!(value["op"], "append_point");
        assert_eq!(value["seq"], 1);
    }

    #[test]
    fn test_decode_matches_encode() {
        let stroke = Stroke::with_id("s1", &Brush::default(), vec![Point::new(0.1, 0.1)]);
        let op = Operation::CreateStroke { stroke };
        assert_eq!(Operation::from_value(&op.to_value()), Some(op));
    }

    #[test]
    fn test_malformed_point_dropped_individually() {
        let value = json!({
            "op": "create_stroke",
            "stroke": {
                "id": "s1",
                "color": "#ff0000",
                "size": 4.0,
                "tool": "pen",
                "points": [
                    { "x": 0.1, "y": 0.1 },
                    { "x": "oops", "y": 0.2 },
                    { "y": 0.3 },
                    { "x": 0.4, "y": 0.4 }
                ]
            }
        });
        let Some(Operation::CreateStroke { stroke }) = Operation::from_value(&value) else {
            panic!("Expected create_stroke");
        };
        assert_eq!(stroke.points, vec![Point::new(0.1, 0.1), Point::new(0.4, 0.4)]);
    }

    #[test]
    fn test_stroke_missing_fields_rejected() {
        let value = json!({
            "op": "create_stroke",
            "stroke": { "id": "s1", "points": [] }
        });
        assert!(Operation::from_value(&value).is_none());

        let value = json!({
            "op": "create_stroke",
            "stroke": { "id": "", "color": "#000", "size": 2, "tool": "pen" }
        });
        assert!(Operation::from_value(&value).is_none());
    }

    #[test]
    fn test_append_with_bad_point_rejected() {
        let value = json!({
            "op": "append_point",
            "stroke_id": "s1",
            "seq": 2,
            "point": { "x": null, "y": 0.5 }
        });
        assert!(Operation::from_value(&value).is_none());
    }

    #[test]
    fn test_unknown_operation_ignored() {
        assert!(Operation::from_value(&json!({ "op": "undo" })).is_none());
        assert!(Operation::from_value(&json!(42)).is_none());
    }
}
