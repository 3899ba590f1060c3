//! CPU rasterizer.
//!
//! Strokes are painted as anti-aliased round-capped polylines into a
//! premultiplied RGBA8 [`Pixmap`]. Coverage is quantized to 8 bits and
//! compositing uses integer arithmetic only, so the same replica and viewport
//! always produce the same bytes.

use kurbo::{Circle, PathEl, Point, Rect};
use peniko::color::Rgba8;
use peniko::{Color, Compose};

use crate::geometry::{StrokeDraw, StrokeGeometry, stroke_draw};
use crate::renderer::{RenderContext, RenderResult, Renderer};

/// Flattening tolerance in device pixels.
const FLATTEN_TOLERANCE: f64 = 0.1;

/// Premultiplied RGBA8 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pixmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Pixmap {
    /// Transparent pixmap.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw premultiplied RGBA bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Premultiplied RGBA at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }

    /// Reset to transparent, reallocating if the size changed.
    pub fn reset(&mut self, width: u32, height: u32) {
        if self.width != width || self.height != height {
            *self = Self::new(width, height);
        } else {
            self.data.fill(0);
        }
    }

    /// Opaque straight-alpha RGBA of this image over `background`.
    pub fn flatten_over(&self, background: Color) -> Vec<u8> {
        let bg = background.to_rgba8();
        let bg = [bg.r as u32, bg.g as u32, bg.b as u32];
        let mut out = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(4) {
            let inv = 255 - px[3] as u32;
            for c in 0..3 {
                out.push((px[c] as u32 + mul255(bg[c], inv)).min(255) as u8);
            }
            out.push(255);
        }
        out
    }

    fn paint(&mut self, mask: &Mask, color: Rgba8, compose: Compose) {
        for row in 0..mask.height {
            for col in 0..mask.width {
                let cov = mask.coverage[(row * mask.width + col) as usize] as u32;
                if cov == 0 {
                    continue;
                }
                let x = mask.x + col;
                let y = mask.y + row;
                let i = (y as usize * self.width as usize + x as usize) * 4;
                let dst = &mut self.data[i..i + 4];
                match compose {
                    Compose::DestOut => {
                        let keep = 255 - mul255(color.a as u32, cov);
                        for c in dst.iter_mut() {
                            *c = mul255(*c as u32, keep) as u8;
                        }
                    }
                    _ => {
                        let sa = mul255(color.a as u32, cov);
                        let src = [
                            mul255(color.r as u32, sa),
                            mul255(color.g as u32, sa),
                            mul255(color.b as u32, sa),
                            sa,
                        ];
                        let inv = 255 - sa;
                        for (d, s) in dst.iter_mut().zip(src) {
                            *d = (s + mul255(*d as u32, inv)).min(255) as u8;
                        }
                    }
                }
            }
        }
    }
}

/// `a * b / 255`, rounded.
fn mul255(a: u32, b: u32) -> u32 {
    (a * b + 127) / 255
}

/// 8-bit coverage over a clipped rectangle of the pixmap.
struct Mask {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    coverage: Vec<u8>,
}

impl Mask {
    /// Mask covering `bounds` clipped to a `width` x `height` surface.
    fn for_bounds(bounds: Rect, width: u32, height: u32) -> Option<Self> {
        let x0 = bounds.x0.floor().max(0.0);
        let y0 = bounds.y0.floor().max(0.0);
        let x1 = bounds.x1.ceil().min(width as f64);
        let y1 = bounds.y1.ceil().min(height as f64);
        if !(x1 > x0 && y1 > y0) {
            return None;
        }
        let (w, h) = ((x1 - x0) as u32, (y1 - y0) as u32);
        Some(Self {
            x: x0 as u32,
            y: y0 as u32,
            width: w,
            height: h,
            coverage: vec![0; w as usize * h as usize],
        })
    }

    /// Raise coverage for pixels within `radius` of the segment `a`-`b`.
    fn add_capsule(&mut self, a: Point, b: Point, radius: f64) {
        let reach = radius + 1.0;
        let x0 = (a.x.min(b.x) - reach).floor().max(self.x as f64) as u32;
        let y0 = (a.y.min(b.y) - reach).floor().max(self.y as f64) as u32;
        let x1 = ((a.x.max(b.x) + reach).ceil() as i64).min((self.x + self.width) as i64);
        let y1 = ((a.y.max(b.y) + reach).ceil() as i64).min((self.y + self.height) as i64);
        for y in y0 as i64..y1 {
            for x in x0 as i64..x1 {
                let center = Point::new(x as f64 + 0.5, y as f64 + 0.5);
                let cov = coverage(segment_distance(center, a, b), radius);
                let idx = ((y as u32 - self.y) * self.width + (x as u32 - self.x)) as usize;
                if cov > self.coverage[idx] {
                    self.coverage[idx] = cov;
                }
            }
        }
    }
}

fn coverage(distance: f64, radius: f64) -> u8 {
    ((radius + 0.5 - distance).clamp(0.0, 1.0) * 255.0).round() as u8
}

fn segment_distance(p: Point, a: Point, b: Point) -> f64 {
    let ab = b - a;
    let len2 = ab.hypot2();
    let t = if len2 == 0.0 {
        0.0
    } else {
        ((p - a).dot(ab) / len2).clamp(0.0, 1.0)
    };
    p.distance(a + ab * t)
}

fn dot_mask(circle: &Circle, width: u32, height: u32) -> Option<Mask> {
    let bounds = kurbo::Shape::bounding_box(circle).inflate(1.0, 1.0);
    let mut mask = Mask::for_bounds(bounds, width, height)?;
    mask.add_capsule(circle.center, circle.center, circle.radius);
    Some(mask)
}

fn path_mask(draw: &StrokeDraw, path: &kurbo::BezPath, width: u32, height: u32) -> Option<Mask> {
    let bounds = draw.geometry.bounds(draw.width).inflate(1.0, 1.0);
    let mut mask = Mask::for_bounds(bounds, width, height)?;
    let radius = draw.width / 2.0;
    let mut last: Option<Point> = None;
    kurbo::flatten(path.iter(), FLATTEN_TOLERANCE, |el| match el {
        PathEl::MoveTo(p) => {
            mask.add_capsule(p, p, radius);
            last = Some(p);
        }
        PathEl::LineTo(p) => {
            if let Some(prev) = last {
                mask.add_capsule(prev, p, radius);
            }
            last = Some(p);
        }
        _ => {}
    });
    Some(mask)
}

/// Renderer that rasterizes on the CPU.
#[derive(Debug, Default)]
pub struct SoftwareRenderer {
    pixmap: Pixmap,
    strokes_drawn: usize,
}

impl Default for Pixmap {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last rendered frame.
    pub fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }

    /// Strokes painted in the last frame.
    pub fn strokes_drawn(&self) -> usize {
        self.strokes_drawn
    }

    fn draw(&mut self, draw: &StrokeDraw) {
        let (w, h) = (self.pixmap.width, self.pixmap.height);
        let mask = match &draw.geometry {
            StrokeGeometry::Dot(circle) => dot_mask(circle, w, h),
            StrokeGeometry::Path(path) => path_mask(draw, path, w, h),
        };
        if let Some(mask) = mask {
            self.pixmap.paint(&mask, draw.color.to_rgba8(), draw.compose);
        }
    }
}

impl Renderer for SoftwareRenderer {
    fn render(&mut self, ctx: &RenderContext) -> RenderResult<()> {
        let (width, height) = ctx.surface_size()?;
        self.pixmap.reset(width, height);
        self.strokes_drawn = 0;
        for stroke in ctx.replica.strokes() {
            if let Some(draw) = stroke_draw(stroke, ctx.viewport_size, ctx.scale_factor) {
                self.draw(&draw);
                self.strokes_drawn += 1;
            }
        }
        Ok(())
    }
}
