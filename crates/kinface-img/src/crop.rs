//! Padded face crops.

use image::{imageops, RgbImage};
use kinface_core::BoundingBox;

/// Padding on each side as a fraction of the face size.
pub const DEFAULT_CROP_PADDING: f32 = 0.2;

/// Cut the face region out of `image`, widened by `padding` × width/height on
/// each side and clipped to the image. Returns `None` when nothing remains.
pub fn crop_face_region(image: &RgbImage, bbox: &BoundingBox, padding: f32) -> Option<RgbImage> {
    let (img_w, img_h) = (image.width() as i64, image.height() as i64);

    let (x, y) = (bbox.x as i64, bbox.y as i64);
    let (w, h) = (bbox.width as i64, bbox.height as i64);
    let pad_w = (w as f32 * padding) as i64;
    let pad_h = (h as f32 * padding) as i64;

    let x1 = (x - pad_w).max(0);
    let y1 = (y - pad_h).max(0);
    let x2 = (x + w + pad_w).min(img_w);
    let y2 = (y + h + pad_h).min(img_h);

    if x2 <= x1 || y2 <= y1 {
        tracing::debug!(?bbox, "face region lies outside the image");
        return None;
    }

    Some(imageops::crop_imm(image, x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32).to_image())
}
