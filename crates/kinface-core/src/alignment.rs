//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical 112×112 position using the five
//! InsightFace reference landmarks and least-squares estimation. The same
//! warp produces the bbox-centred crops consumed by the attribute model.

use crate::types::{BoundingBox, Point, LANDMARK_COUNT};
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [Point; LANDMARK_COUNT] = [
    Point::new(38.2946, 51.6963), // left eye
    Point::new(73.5318, 51.5014), // right eye
    Point::new(56.0252, 71.7366), // nose
    Point::new(41.5493, 92.3655), // left mouth
    Point::new(70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform mapping source pixels to output pixels:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    /// Least-squares fit from `src` landmarks onto `dst` landmarks.
    pub fn estimate(src: &[Point; LANDMARK_COUNT], dst: &[Point; LANDMARK_COUNT]) -> Self {
        // Overdetermined system A * [a, b, tx, ty]^T = B, one row pair per point:
        //   sx * a - sy * b + tx = dx
        //   sy * a + sx * b + ty = dy
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for (s, d) in src.iter().zip(dst.iter()) {
            let r1 = [s.x, -s.y, 1.0, 0.0];
            let r2 = [s.y, s.x, 0.0, 1.0];
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
                }
                atb[j] += r1[j] * d.x + r2[j] * d.y;
            }
        }

        let [a, b, tx, ty] = solve_4x4(ata, atb);
        Self { a, b, tx, ty }
    }

    /// Scale-and-centre transform: `bbox` centre lands on the output centre and
    /// the longer side times `margin` spans `out_size` pixels.
    pub fn centered_on(bbox: &BoundingBox, out_size: u32, margin: f32) -> Self {
        let side = bbox.width.max(bbox.height) * margin;
        let scale = if side > 0.0 { out_size as f32 / side } else { 1.0 };
        let center = bbox.center();
        let half = out_size as f32 / 2.0;
        Self {
            a: scale,
            b: 0.0,
            tx: half - center.x * scale,
            ty: half - center.y * scale,
        }
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x - self.b * p.y + self.tx,
            self.b * p.x + self.a * p.y + self.ty,
        )
    }

    /// Warp `image` into an `out_size`×`out_size` crop with bilinear sampling.
    /// Pixels mapped from outside the source are black.
    pub fn warp(&self, image: &RgbImage, out_size: u32) -> RgbImage {
        let mut output = RgbImage::new(out_size, out_size);

        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return output;
        }
        let ia = self.a / det;
        let ib = self.b / det;
        let (w, h) = (image.width() as i64, image.height() as i64);

        let sample = |x: i64, y: i64, c: usize| -> f32 {
            if x >= 0 && x < w && y >= 0 && y < h {
                image.get_pixel(x as u32, y as u32)[c] as f32
            } else {
                0.0
            }
        };

        for (ox, oy, pixel) in output.enumerate_pixels_mut() {
            // Inverse map: src = R^-1 * (dst - t)
            let dx = ox as f32 - self.tx;
            let dy = oy as f32 - self.ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let mut rgb = [0u8; 3];
            for (c, out) in rgb.iter_mut().enumerate() {
                let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1, c) * fx * fy;
                *out = val.round().clamp(0.0, 255.0) as u8;
            }
            *pixel = Rgb(rgb);
        }

        output
    }
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
/// A singular system yields the identity scale with no translation.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(a: [[f32; 4]; 4], b: [f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&a[i]);
        m[i][4] = b[i];
    }

    for col in 0..4 {
        let max_row = (col..4)
            .max_by(|&r1, &r2| {
                m[r1][col]
                    .abs()
                    .partial_cmp(&m[r2][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Align a detected face to a canonical 112×112 RGB crop for ArcFace.
pub fn align_face(image: &RgbImage, landmarks: &[Point; LANDMARK_COUNT]) -> RgbImage {
    SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112).warp(image, ALIGNED_SIZE)
}
