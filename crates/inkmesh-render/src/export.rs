//! PNG export of a rendered frame.

use peniko::Color;
use thiserror::Error;

use crate::raster::Pixmap;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("PNG encoding failed: {0}")]
    Encoding(#[from] png::EncodingError),
    #[error("Nothing to export: image is empty")]
    EmptyImage,
}

/// Encode a frame as an opaque PNG over `background`.
pub fn encode_png(pixmap: &Pixmap, background: Color) -> Result<Vec<u8>, ExportError> {
    if pixmap.width() == 0 || pixmap.height() == 0 {
        return Err(ExportError::EmptyImage);
    }

    let rgba = pixmap.flatten_over(background);
    let mut data = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut data, pixmap.width(), pixmap.height());
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&rgba)?;
    }
    log::debug!("Exported {}x{} PNG ({} bytes)", pixmap.width(), pixmap.height(), data.len());
    Ok(data)
}
