use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;

use crate::{JobError, JobResult};

/// Encodes an image as a base64 PNG, without any `data:` prefix.
pub fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

/// Decodes a base64 image, with or without a `data:<mime>;base64,` prefix, into RGB.
pub fn base64_to_image(text: &str) -> JobResult<DynamicImage> {
    let text = text.trim();
    let payload = match text.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or_else(|| JobError::decode("reference_image data URI has no payload"))?,
        None => text,
    };
    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| JobError::decode(format!("reference_image is not valid base64: {e}")))?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| JobError::decode(format!("reference_image is not a readable image: {e}")))?;
    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}
