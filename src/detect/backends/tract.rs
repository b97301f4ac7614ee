#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const NMS_IOU: f32 = 0.45;

type Plan = TypedRunnableModel<TypedModel>;

/// Tract-based backend for YOLO-style ONNX models.
///
/// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + C, N]` output where
/// the first four rows are `cx, cy, w, h` in input pixels and the remaining `C`
/// rows are per-class scores.
pub struct TractDetector {
    model_path: PathBuf,
    model: Option<Plan>,
    size: u32,
    labels: Vec<String>,
    confidence_threshold: f32,
}

impl TractDetector {
    /// Prepare a detector for the model at `model_path`. The model is loaded by
    /// `warm_up`.
    pub fn new<P: AsRef<Path>>(model_path: P, size: u32, labels: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(anyhow!("model file {} does not exist", model_path.display()));
        }
        Ok(Self {
            model_path: model_path.to_path_buf(),
            model: None,
            size,
            labels,
            confidence_threshold: 0.35,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        if frame.width() != self.size || frame.height() != self.size {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width(),
                frame.height(),
                self.size,
                self.size
            ));
        }

        let pixels = frame.pixels();
        let width = self.size as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.size as usize, width),
            |(_, channel, y, x)| {
                let idx = (y * width + x) * 3 + channel;
                pixels[idx] as f32 / 255.0
            },
        );

        Ok(input.into_tensor())
    }

    fn label_for(&self, class: usize) -> String {
        self.labels
            .get(class)
            .cloned()
            .unwrap_or_else(|| format!("class{}", class))
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output must be rank 3")?;
        let (_, rows, anchors) = view.dim();
        if rows < 5 {
            return Err(anyhow!("model output has {} rows, expected at least 5", rows));
        }
        let classes = rows - 4;
        let scale = self.size as f32;

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let mut best_class = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for c in 0..classes {
                let score = view[[0, 4 + c, a]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if !best_score.is_finite() || best_score < self.confidence_threshold {
                continue;
            }
            let (cx, cy) = (view[[0, 0, a]] / scale, view[[0, 1, a]] / scale);
            let (w, h) = (view[[0, 2, a]] / scale, view[[0, 3, a]] / scale);
            let bbox = BoundingBox {
                x: (cx - w / 2.0).clamp(0.0, 1.0),
                y: (cy - h / 2.0).clamp(0.0, 1.0),
                w: w.clamp(0.0, 1.0),
                h: h.clamp(0.0, 1.0),
            };
            candidates.push(Detection::new(self.label_for(best_class), best_score).with_bbox(bbox));
        }

        Ok(suppress_overlaps(candidates))
    }
}

/// Greedy per-label non-maximum suppression.
fn suppress_overlaps(mut candidates: Vec<Detection>) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for cand in candidates {
        let overlaps = kept.iter().any(|k| {
            k.label == cand.label
                && matches!((k.bbox, cand.bbox), (Some(a), Some(b)) if a.iou(&b) > NMS_IOU)
        });
        if !overlaps {
            kept.push(cand);
        }
    }
    kept
}

impl Detector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.size, self.size)
    }

    fn warm_up(&mut self) -> Result<()> {
        if self.model.is_some() {
            return Ok(());
        }
        let size = self.size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(&self.model_path)
            .with_context(|| {
                format!("failed to load ONNX model from {}", self.model_path.display())
            })?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        log::info!(
            "tract detector loaded {} ({} labels)",
            self.model_path.display(),
            self.labels.len()
        );
        self.model = Some(model);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.model.is_some()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("tract detector used before warm_up"))?;
        let outputs = model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }
}
