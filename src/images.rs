//! Image decoding and re-encoding helpers
//!
//! Captioning works on RGB pixels; the cache serves PNG.

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};

/// Check if data starts with the PNG signature
pub fn is_png(data: &[u8]) -> bool {
    data.len() >= 8 && data[0..8] == *b"\x89PNG\r\n\x1a\n"
}

/// Decode any format supported by the `image` crate into 8-bit RGB.
///
/// Alpha is dropped and grayscale is expanded, so the captioner always
/// receives three channels.
pub fn decode_rgb(data: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory(data).context("Failed to decode image")?;
    Ok(img.to_rgb8())
}

/// Scale an image down so neither side exceeds `max_dimension`,
/// keeping the aspect ratio. Smaller images are returned untouched.
pub fn downscale(img: RgbImage, max_dimension: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    if w <= max_dimension && h <= max_dimension {
        return img;
    }

    let scale = (max_dimension as f64) / (w.max(h) as f64);
    let new_w = (((w as f64) * scale).round() as u32).max(1);
    let new_h = (((h as f64) * scale).round() as u32).max(1);

    DynamicImage::ImageRgb8(img)
        .resize_exact(new_w, new_h, image::imageops::FilterType::Lanczos3)
        .to_rgb8()
}

/// Encode RGB pixels as PNG
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buf);
    img.write_to(&mut cursor, ImageFormat::Png)
        .context("Failed to encode png")?;
    Ok(buf)
}

/// Re-encode arbitrary image bytes as PNG, preserving alpha.
/// PNG input is returned as-is.
pub fn to_png(data: Vec<u8>) -> Result<Vec<u8>> {
    if is_png(&data) {
        return Ok(data);
    }

    let img = image::load_from_memory(&data).context("Failed to decode image")?;
    let mut buf = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buf);
    img.write_to(&mut cursor, ImageFormat::Png)
        .context("Failed to encode png")?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) fn get_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    let img = image::load_from_memory(data).context("Failed to decode image for dimensions")?;
    Ok(img.dimensions())
}

#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });

    let mut buf = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buf);
    img.write_to(&mut cursor, ImageFormat::Png).unwrap();
    buf
}
