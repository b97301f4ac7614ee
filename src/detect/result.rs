/// One labelled region found by a detector.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox: None,
        }
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

/// Axis-aligned box in normalized (0..1) image coordinates, top-left origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.w).min(other.x + other.w);
        let bottom = (self.y + self.h).min(other.y + other.h);
        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Case-insensitive label membership test.
pub fn contains_label(detections: &[Detection], label: &str) -> bool {
    detections
        .iter()
        .any(|d| d.label.eq_ignore_ascii_case(label))
}
