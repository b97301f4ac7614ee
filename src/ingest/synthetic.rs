//! Synthetic camera for `stub://` URLs.
//!
//! Renders a flat gray scene and, on alternating stretches of `period` frames, a
//! hard-hat yellow patch in the middle. Paired with the color detector this walks
//! the whole gate cycle without any hardware attached.
//!
//! `stub://camera?period=20` sets the stretch length; `period=0` keeps the
//! scene empty.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use url::Url;

use super::{FrameSource, SourceStats};
use crate::config::CameraSettings;
use crate::frame::Frame;

const DEFAULT_PERIOD: u64 = 30;
const BACKGROUND: Rgb<u8> = Rgb([96, 96, 96]);
const HARD_HAT: Rgb<u8> = Rgb([250, 200, 20]);

pub struct SyntheticSource {
    url: String,
    width: u32,
    height: u32,
    period: u64,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            url: "stub://camera".to_string(),
            width,
            height,
            period: DEFAULT_PERIOD,
            frame_count: 0,
            connected: false,
        }
    }

    pub fn from_settings(settings: &CameraSettings) -> Result<Self> {
        let url = Url::parse(&settings.url).context("parse stub camera url")?;
        let mut period = DEFAULT_PERIOD;
        for (key, value) in url.query_pairs() {
            if key == "period" {
                period = value
                    .parse()
                    .map_err(|_| anyhow!("invalid stub camera period '{}'", value))?;
            }
        }
        Ok(Self {
            url: settings.url.clone(),
            ..Self::new(settings.width, settings.height)
        }
        .with_period(period))
    }

    /// Frames per stretch with and without the patch.
    pub fn with_period(mut self, period: u64) -> Self {
        self.period = period;
        self
    }

    fn patch_visible(&self, index: u64) -> bool {
        self.period > 0 && (index / self.period) % 2 == 1
    }

    fn render(&self, with_patch: bool) -> RgbImage {
        let mut image = RgbImage::from_pixel(self.width, self.height, BACKGROUND);
        if with_patch {
            let (pw, ph) = ((self.width / 4).max(1), (self.height / 4).max(1));
            let (x0, y0) = ((self.width - pw) / 2, (self.height - ph) / 3);
            for y in y0..y0 + ph {
                for x in x0..x0 + pw {
                    image.put_pixel(x, y, HARD_HAT);
                }
            }
        }
        image
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "SyntheticSource: connected to {} ({}x{})",
            self.url,
            self.width,
            self.height
        );
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        let with_patch = self.patch_visible(self.frame_count);
        self.frame_count += 1;
        Ok(Frame::new(self.render(with_patch), self.frame_count))
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            capture_errors: 0,
            source: self.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{contains_label, ColorDetector, Detector};

    #[test]
    fn patch_alternates_every_period() -> Result<()> {
        let mut source = SyntheticSource::new(80, 60).with_period(2);
        source.connect()?;
        let mut detector = ColorDetector::new("helmet", 32);

        let mut seen = Vec::new();
        for _ in 0..8 {
            let frame = source.capture_frame()?;
            let detections = detector.detect(&frame.resized(32, 32))?;
            seen.push(contains_label(&detections, "helmet"));
        }
        assert_eq!(seen, vec![false, false, true, true, false, false, true, true]);
        Ok(())
    }

    #[test]
    fn zero_period_stays_empty() -> Result<()> {
        let mut source = SyntheticSource::new(16, 16).with_period(0);
        source.connect()?;
        for _ in 0..5 {
            let frame = source.capture_frame()?;
            assert!(frame.image().pixels().all(|p| *p == BACKGROUND));
        }
        Ok(())
    }

    #[test]
    fn period_is_read_from_url() -> Result<()> {
        let settings = CameraSettings {
            url: "stub://camera?period=5".to_string(),
            ..CameraSettings::default()
        };
        let source = SyntheticSource::from_settings(&settings)?;
        assert_eq!(source.period, 5);
        assert_eq!(source.stats().source, "stub://camera?period=5");
        Ok(())
    }

    #[test]
    fn capture_requires_connect() {
        let mut source = SyntheticSource::new(8, 8);
        assert!(source.capture_frame().is_err());
        assert!(!source.is_healthy());
    }
}
