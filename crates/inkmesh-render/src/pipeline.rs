//! Frame loop glue between a replica and a renderer.

use inkmesh_core::Replica;
use kurbo::Size;
use peniko::Color;

use crate::renderer::{RenderContext, RenderResult, Renderer};
use crate::scheduler::{FrameScheduler, RedrawHandle};

/// Owns a renderer and redraws it at most once per requested frame.
pub struct RenderPipeline<R: Renderer> {
    renderer: R,
    scheduler: FrameScheduler,
    viewport: Size,
    scale_factor: f64,
    background: Color,
}

impl<R: Renderer> RenderPipeline<R> {
    /// Create a pipeline. The first frame is already requested.
    pub fn new(renderer: R, viewport: Size, scale_factor: f64) -> Self {
        let scheduler = FrameScheduler::new();
        scheduler.request_redraw();
        Self {
            renderer,
            scheduler,
            viewport,
            scale_factor,
            background: Color::from_rgba8(255, 255, 255, 255),
        }
    }

    pub fn with_background(mut self, color: Color) -> Self {
        self.background = color;
        self
    }

    /// Change the viewport or device pixel ratio; requests a redraw if either
    /// differs.
    pub fn resize(&mut self, viewport: Size, scale_factor: f64) {
        if viewport != self.viewport || scale_factor != self.scale_factor {
            self.viewport = viewport;
            self.scale_factor = scale_factor;
            self.scheduler.request_redraw();
        }
    }

    pub fn viewport(&self) -> Size {
        self.viewport
    }

    pub fn request_redraw(&self) -> bool {
        self.scheduler.request_redraw()
    }

    /// Handle to hand to a replica change listener.
    pub fn redraw_handle(&self) -> RedrawHandle {
        self.scheduler.handle()
    }

    /// Draw a frame if one is pending. Returns whether a frame was drawn.
    pub fn on_frame(&mut self, replica: &Replica) -> RenderResult<bool> {
        if !self.scheduler.begin_frame() {
            return Ok(false);
        }
        let ctx = RenderContext::new(replica, self.viewport)
            .with_scale_factor(self.scale_factor)
            .with_background(self.background);
        self.renderer.render(&ctx)?;
        Ok(true)
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }
}
