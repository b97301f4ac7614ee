use anyhow::Result;

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Minimum fraction of hard-hat coloured pixels for a positive detection.
const DEFAULT_MIN_COVERAGE: f32 = 0.02;

/// Colour-threshold backend.
///
/// Flags the target label when enough "safety yellow" pixels are present. No model
/// file is needed, which makes it the default for bench setups and the synthetic
/// camera.
pub struct ColorDetector {
    label: String,
    input_size: u32,
    min_coverage: f32,
}

impl ColorDetector {
    pub fn new(label: impl Into<String>, input_size: u32) -> Self {
        Self {
            label: label.into(),
            input_size,
            min_coverage: DEFAULT_MIN_COVERAGE,
        }
    }

    #[cfg(test)]
    fn with_min_coverage(mut self, min_coverage: f32) -> Self {
        self.min_coverage = min_coverage.clamp(f32::EPSILON, 1.0);
        self
    }
}

fn is_hard_hat_yellow(r: u8, g: u8, b: u8) -> bool {
    r >= 170 && g >= 140 && b <= 90 && r.saturating_sub(b) >= 100
}

impl Detector for ColorDetector {
    fn name(&self) -> &'static str {
        "color"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.input_size, self.input_size)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let width = frame.width();
        let height = frame.height();
        let total = (width as usize) * (height as usize);
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut hits = 0usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
        for (i, px) in frame.pixels().chunks_exact(3).enumerate() {
            if !is_hard_hat_yellow(px[0], px[1], px[2]) {
                continue;
            }
            hits += 1;
            let x = (i % width as usize) as u32;
            let y = (i / width as usize) as u32;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let coverage = hits as f32 / total as f32;
        if hits == 0 || coverage < self.min_coverage {
            return Ok(Vec::new());
        }

        let confidence = (coverage / (2.0 * self.min_coverage)).min(1.0);
        let bbox = BoundingBox {
            x: min_x as f32 / width as f32,
            y: min_y as f32 / height as f32,
            w: (max_x - min_x + 1) as f32 / width as f32,
            h: (max_y - min_y + 1) as f32 / height as f32,
        };
        Ok(vec![Detection::new(self.label.clone(), confidence).with_bbox(bbox)])
    }
}
