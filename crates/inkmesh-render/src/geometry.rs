//! Stroke geometry in device space.

use inkmesh_core::Stroke;
use kurbo::{BezPath, Circle, Point, Rect, Size};
use peniko::Compose;
use peniko::color::{Srgb, parse_color as parse_css_color};
use peniko::Color;

/// Device-space shape of a stroke.
#[derive(Debug, Clone, PartialEq)]
pub enum StrokeGeometry {
    /// A single tap: filled circle of radius `size / 2`.
    Dot(Circle),
    /// A smoothed polyline, stroked with round caps and joins.
    Path(BezPath),
}

impl StrokeGeometry {
    /// Conservative device-space bounds of the painted area.
    pub fn bounds(&self, width: f64) -> Rect {
        match self {
            StrokeGeometry::Dot(circle) => kurbo::Shape::bounding_box(circle),
            StrokeGeometry::Path(path) => kurbo::Shape::bounding_box(path).inflate(width / 2.0, width / 2.0),
        }
    }
}

/// Everything needed to paint one stroke.
#[derive(Debug, Clone)]
pub struct StrokeDraw {
    pub geometry: StrokeGeometry,
    /// Line width in device pixels.
    pub width: f64,
    pub color: Color,
    /// `SrcOver` for pens, `DestOut` for erasers.
    pub compose: Compose,
}

/// Parse a CSS color, falling back to opaque black.
pub fn parse_color(css: &str) -> Color {
    match parse_css_color(css) {
        Ok(color) => color.to_alpha_color::<Srgb>(),
        Err(_) => {
            log::debug!("Unparseable stroke color {:?}, using black", css);
            Color::from_rgba8(0, 0, 0, 255)
        }
    }
}

fn to_device(point: Point, viewport: Size) -> Point {
    Point::new(point.x * viewport.width, point.y * viewport.height)
}

/// Device-space geometry for a stroke; `None` for a stroke without points.
///
/// Two or more points are joined by quadratic segments through successive
/// midpoints, which smooths the polyline without overshooting it.
pub fn stroke_geometry(stroke: &Stroke, viewport: Size, scale_factor: f64) -> Option<StrokeGeometry> {
    let points: Vec<Point> = stroke.points.iter().map(|p| to_device(*p, viewport)).collect();
    match points.as_slice() {
        [] => None,
        [only] => Some(StrokeGeometry::Dot(Circle::new(*only, stroke.size * scale_factor / 2.0))),
        [first, rest @ ..] => {
            let mut path = BezPath::new();
            path.move_to(*first);
            for pair in points[1..].windows(2) {
                path.quad_to(pair[0], pair[0].midpoint(pair[1]));
            }
            if let Some(last) = rest.last() {
                path.line_to(*last);
            }
            Some(StrokeGeometry::Path(path))
        }
    }
}

/// Geometry plus paint for a stroke.
pub fn stroke_draw(stroke: &Stroke, viewport: Size, scale_factor: f64) -> Option<StrokeDraw> {
    let geometry = stroke_geometry(stroke, viewport, scale_factor)?;
    let (color, compose) = if stroke.is_eraser() {
        (Color::from_rgba8(0, 0, 0, 255), Compose::DestOut)
    } else {
        (parse_color(&stroke.color), Compose::SrcOver)
    };
    Some(StrokeDraw {
        geometry,
        width: stroke.size * scale_factor,
        color,
        compose,
    })
}
