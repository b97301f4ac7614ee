//! V4L2 camera source for USB webcams and CSI cameras on the gate controller.
//!
//! The device is asked for RGB3 first. When the driver refuses, whatever format it
//! settles on is accepted if it is YUYV, NV12 or MJPG and converted per frame.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::Instant;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{health_grace, FrameSource, SourceStats};
use crate::config::CameraSettings;
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CaptureFormat {
    Raw(PixelFormat),
    Mjpeg,
}

impl CaptureFormat {
    fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        if fourcc == b"MJPG" {
            return Some(CaptureFormat::Mjpeg);
        }
        PixelFormat::from_fourcc(fourcc).map(CaptureFormat::Raw)
    }
}

pub struct V4l2Source {
    settings: CameraSettings,
    state: Option<DeviceState>,
    format: CaptureFormat,
    frame_count: u64,
    error_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            active_width: settings.width,
            active_height: settings.height,
            settings,
            state: None,
            format: CaptureFormat::Raw(PixelFormat::Rgb24),
            frame_count: 0,
            error_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        self.error_count += 1;
        self.last_error = Some(err.to_string());
        err
    }

    fn to_frame(&self, buf: &[u8]) -> Result<Frame> {
        let sequence = self.frame_count + 1;
        match self.format {
            CaptureFormat::Mjpeg => Frame::decode_jpeg(buf, sequence),
            CaptureFormat::Raw(format) => {
                let rgb = normalize_to_rgb(buf, self.active_width, self.active_height, format)?;
                Frame::from_rgb(rgb, self.active_width, self.active_height, sequence)
            }
        }
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device_path = self.settings.url.clone();
        let mut device = v4l::Device::with_path(&device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.settings.width;
        format.height = self.settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let capture_format = CaptureFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} uses unsupported pixel format {}",
                device_path,
                format.fourcc
            )
        })?;

        if self.settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", device_path, err);
            }
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        self.state = Some(state);
        self.format = capture_format;
        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;
        log::info!(
            "V4l2Source: connected to {} ({}x{} {})",
            device_path,
            self.active_width,
            self.active_height,
            format.fourcc
        );
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        if self.state.is_none() {
            if let Err(err) = self.connect() {
                return Err(self.fail(err));
            }
        }
        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let captured = state.with_mut(|fields| {
            fields.stream.next().map(|(buf, meta)| {
                let used = (meta.bytesused as usize).min(buf.len());
                let used = if used == 0 { buf.len() } else { used };
                buf[..used].to_vec()
            })
        });
        let buf = match captured {
            Ok(buf) => buf,
            Err(err) => {
                // A dead stream never recovers; reopen the device next time.
                self.state = None;
                return Err(self.fail(anyhow::Error::new(err).context("capture v4l2 frame")));
            }
        };
        let frame = match self.to_frame(&buf) {
            Ok(frame) => frame,
            Err(err) => return Err(self.fail(err)),
        };

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        self.last_error = None;
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= health_grace(self.settings.target_fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            capture_errors: self.error_count,
            source: self.settings.url.clone(),
        }
    }
}
