use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

/// Grid-view thumbnail bounds.
pub const THUMBNAIL_WIDTH: u32 = 640;
pub const THUMBNAIL_HEIGHT: u32 = 400;
pub const JPEG_QUALITY: u8 = 80;

/// Downscale a page screenshot into a JPEG thumbnail.
///
/// The image is cropped to the grid aspect ratio from the top, so the visible
/// part of the page above the fold is kept. Images smaller than the bounds
/// are not upscaled.
pub fn make_thumbnail(screenshot: &[u8]) -> Result<Vec<u8>, ThumbnailError> {
    let img = image::load_from_memory(screenshot)?;
    let cropped = crop_to_aspect(img);
    let resized = if cropped.width() > THUMBNAIL_WIDTH || cropped.height() > THUMBNAIL_HEIGHT {
        cropped.resize(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT, FilterType::Triangle)
    } else {
        cropped
    };

    let rgb = resized.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(out)
}

fn crop_to_aspect(img: DynamicImage) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    // Keep width; cut the bottom of tall full-page captures.
    let target_h = (u64::from(w) * u64::from(THUMBNAIL_HEIGHT) / u64::from(THUMBNAIL_WIDTH)) as u32;
    if target_h > 0 && h > target_h {
        img.crop_imm(0, 0, w, target_h)
    } else {
        img
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error("Screenshot could not be processed: {0}")]
    Image(#[from] image::ImageError),
}
