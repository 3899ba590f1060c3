//! Renderer trait abstraction.

use inkmesh_core::Replica;
use kurbo::Size;
use peniko::Color;
use thiserror::Error;

/// Renderer errors.
#[derive(Debug, Error)]
pub enum RendererError {
    #[error("Viewport too large: {width}x{height}")]
    ViewportTooLarge { width: f64, height: f64 },
    #[error("Render failed: {0}")]
    RenderFailed(String),
}

/// Result type for renderer operations.
pub type RenderResult<T> = Result<T, RendererError>;

/// Largest supported surface edge in device pixels.
pub const MAX_SURFACE_DIMENSION: u32 = 16_384;

/// Context for a single render frame.
pub struct RenderContext<'a> {
    /// The replica to render.
    pub replica: &'a Replica,
    /// Viewport size in physical pixels.
    pub viewport_size: Size,
    /// Device pixel ratio (for HiDPI).
    pub scale_factor: f64,
    /// Background color used when flattening the frame.
    pub background_color: Color,
}

impl<'a> RenderContext<'a> {
    /// Create a new render context.
    pub fn new(replica: &'a Replica, viewport_size: Size) -> Self {
        Self {
            replica,
            viewport_size,
            scale_factor: 1.0,
            background_color: Color::from_rgba8(255, 255, 255, 255),
        }
    }

    /// Set the scale factor for HiDPI.
    pub fn with_scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    /// Set the background color.
    pub fn with_background(mut self, color: Color) -> Self {
        self.background_color = color;
        self
    }

    /// Surface size in whole device pixels.
    pub fn surface_size(&self) -> RenderResult<(u32, u32)> {
        let w = self.viewport_size.width.max(0.0).round();
        let h = self.viewport_size.height.max(0.0).round();
        if !w.is_finite() || !h.is_finite() || w > MAX_SURFACE_DIMENSION as f64 || h > MAX_SURFACE_DIMENSION as f64 {
            return Err(RendererError::ViewportTooLarge { width: w, height: h });
        }
        Ok((w as u32, h as u32))
    }
}

/// Trait for rendering backends.
pub trait Renderer: Send {
    /// Redraw the whole frame from the context.
    fn render(&mut self, ctx: &RenderContext) -> RenderResult<()>;

    /// Get the background color (for clearing).
    fn background_color(&self, ctx: &RenderContext) -> Color {
        ctx.background_color
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_size_rounds() {
        let replica = Replica::new("me");
        let ctx = RenderContext::new(&replica, Size::new(99.6, 10.2));
        assert_eq!(ctx.surface_size().unwrap(), (100, 10));
    }

    #[test]
    fn test_surface_size_limits() {
        let replica = Replica::new("me");
        let ctx = RenderContext::new(&replica, Size::new(1e9, 10.0));
        assert!(matches!(ctx.surface_size(), Err(RendererError::ViewportTooLarge { .. })));
        let ctx = RenderContext::new(&replica, Size::new(-5.0, 10.0));
        assert_eq!(ctx.surface_size().unwrap(), (0, 10));
    }
}
