//! InkMesh Render Library
//!
//! Turns a replica into pixels. Rendering is a pure function of the replica
//! and the viewport: every frame recomputes the whole canvas, so two peers
//! holding the same operations produce identical images.

mod export;
mod geometry;
mod raster;
mod renderer;
mod scheduler;

pub mod pipeline;

pub use export::{ExportError, encode_png};
pub use geometry::{StrokeDraw, StrokeGeometry, parse_color, stroke_draw, stroke_geometry};
pub use pipeline::RenderPipeline;
pub use raster::{Pixmap, SoftwareRenderer};
pub use renderer::{RenderContext, RenderResult, Renderer, RendererError};
pub use scheduler::{FrameScheduler, RedrawHandle};
