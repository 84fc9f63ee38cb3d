//! QR payload rendering

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::ImageFormat;
use qrcode::QrCode;
use std::io::Cursor;
use thiserror::Error;

/// Edge length of the rendered image in pixels
pub const QR_SIZE: u32 = 300;

#[derive(Debug, Error)]
pub enum QrError {
    #[error("QR encoding failed: {0}")]
    Encode(#[from] qrcode::types::QrError),
    #[error("PNG encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Render `payload` as a PNG
pub fn render_png(payload: &str, size: u32) -> Result<Vec<u8>, QrError> {
    let code = QrCode::new(payload.as_bytes())?;
    let image = code.render::<image::Luma<u8>>().build();

    let resized = image::imageops::resize(
        &image,
        size,
        size,
        image::imageops::FilterType::Nearest,
    );

    let mut buffer = Cursor::new(Vec::new());
    resized.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Render `payload` as a `data:image/png;base64,...` URL
pub fn png_data_url(payload: &str) -> Result<String, QrError> {
    let png = render_png(payload, QR_SIZE)?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(png)))
}
