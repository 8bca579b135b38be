//! SCRFD face detection on ONNX Runtime.
//!
//! The image is scaled to fit a 640x640 canvas anchored at the top-left
//! corner, the three stride heads are decoded anchor by anchor and
//! overlapping boxes are removed by greedy NMS.

use crate::types::{BoundingBox, Detection, Point, LANDMARK_COUNT};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIDE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const HEADS_PER_STRIDE: usize = 3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}: download buffalo_l from insightface and place it in the model directory")]
    ModelNotFound(String),
    #[error("detector inference failed: {0}")]
    InferenceFailed(String),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale between the source image and the resized region of the canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    width: u32,
    height: u32,
}

impl Letterbox {
    /// Fit `src_w` x `src_h` inside a `side` square, keeping the aspect ratio.
    fn fit(src_w: u32, src_h: u32, side: u32) -> Self {
        let (width, height) = if src_h > src_w {
            ((side as f32 * src_w as f32 / src_h as f32) as u32, side)
        } else {
            (side, (side as f32 * src_h as f32 / src_w as f32) as u32)
        };
        Self {
            scale: side as f32 / src_w.max(src_h) as f32,
            width: width.max(1),
            height: height.max(1),
        }
    }

    fn to_source(self, x: f32, y: f32) -> Point {
        Point::new(x / self.scale, y / self.scale)
    }
}

/// Output indices of the score, box and keypoint heads of one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct HeadSlots {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Head slots per stride, in [`STRIDES`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputLayout([HeadSlots; 3]);

impl OutputLayout {
    /// Map outputs named `score_8`, `bbox_16`, `kps_32`... to their strides.
    /// Exports with other names use the usual score, bbox, kps block order.
    fn resolve(names: &[String]) -> Self {
        let find = |head: &str, stride: usize| {
            let wanted = format!("{head}_{stride}");
            names.iter().position(|n| *n == wanted)
        };

        let mut slots = [HeadSlots::default(); 3];
        for (slot, &stride) in slots.iter_mut().zip(STRIDES.iter()) {
            match (find("score", stride), find("bbox", stride), find("kps", stride)) {
                (Some(score), Some(bbox), Some(kps)) => *slot = HeadSlots { score, bbox, kps },
                _ => {
                    tracing::debug!(?names, "unrecognised SCRFD output names, using block order");
                    return Self::blocks();
                }
            }
        }
        Self(slots)
    }

    fn blocks() -> Self {
        Self(std::array::from_fn(|i| HeadSlots {
            score: i,
            bbox: i + STRIDES.len(),
            kps: i + 2 * STRIDES.len(),
        }))
    }
}

/// SCRFD detector session. Needs `&mut` to run.
pub struct FaceDetector {
    session: Session,
    layout: OutputLayout,
}

impl FaceDetector {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let expected = STRIDES.len() * HEADS_PER_STRIDE;
        if names.len() < expected {
            return Err(DetectorError::InferenceFailed(format!(
                "expected {expected} SCRFD outputs with keypoints, model has {}",
                names.len()
            )));
        }

        let layout = OutputLayout::resolve(&names);
        tracing::info!(path = model_path, outputs = ?names, ?layout, "detector loaded");

        Ok(Self { session, layout })
    }

    /// Faces in `image`, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }

        let letterbox = Letterbox::fit(image.width(), image.height(), INPUT_SIDE);
        let input = to_input_tensor(image, letterbox);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, slots) in STRIDES.iter().zip(self.layout.0) {
            let mut heads: [&[f32]; HEADS_PER_STRIDE] = [&[]; HEADS_PER_STRIDE];
            for (head, idx) in heads.iter_mut().zip([slots.score, slots.bbox, slots.kps]) {
                let (_, data) = outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                    DetectorError::InferenceFailed(format!("output {idx} (stride {stride}): {e}"))
                })?;
                *head = data;
            }
            let [scores, boxes, kps] = heads;
            candidates.extend(decode_head(scores, boxes, kps, stride, letterbox, SCORE_THRESHOLD));
        }

        let faces = suppress(candidates, NMS_IOU);
        tracing::debug!(width = image.width(), height = image.height(), faces = faces.len(), "detection done");
        Ok(faces)
    }
}

/// Resize into the top-left of a black canvas and normalize to NCHW.
fn to_input_tensor(image: &RgbImage, letterbox: Letterbox) -> Array4<f32> {
    let resized = imageops::resize(image, letterbox.width, letterbox.height, FilterType::Triangle);
    let mut canvas = RgbImage::new(INPUT_SIDE, INPUT_SIDE);
    imageops::replace(&mut canvas, &resized, 0, 0);

    let side = INPUT_SIDE as usize;
    Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        (canvas.get_pixel(x as u32, y as u32)[c] as f32 - PIXEL_MEAN) / PIXEL_STD
    })
}

/// Decode one stride's anchors into source-image detections.
fn decode_head(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let cols = INPUT_SIDE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(anchor, &score)| {
            let cell = anchor / ANCHORS_PER_CELL;
            let cx = (cell % cols) as f32 * step;
            let cy = (cell / cols) as f32 * step;

            let d = boxes.get(anchor * 4..anchor * 4 + 4)?;
            let p1 = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
            let p2 = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);

            let kp_start = anchor * LANDMARK_COUNT * 2;
            let landmarks = kps.get(kp_start..kp_start + LANDMARK_COUNT * 2).map(|k| {
                std::array::from_fn(|i| letterbox.to_source(cx + k[2 * i] * step, cy + k[2 * i + 1] * step))
            });

            Some(Detection {
                bbox: BoundingBox::from_corners(p1.x, p1.y, p2.x, p2.y),
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS. The result is sorted by confidence, highest first.
fn suppress(mut candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}
