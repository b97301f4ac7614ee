//! HTTP camera source.
//!
//! Handles the two shapes network cameras commonly serve: a
//! `multipart/x-mixed-replace` MJPEG stream, or a plain JPEG snapshot that is
//! re-fetched for every frame. Frames are located by their SOI/EOI markers rather
//! than by multipart headers, which tolerates cameras that get the boundary wrong.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use super::{frame_interval, health_grace, FrameSource, SourceStats};
use crate::frame::{Frame, MAX_JPEG_BYTES};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MjpegSource {
    url: String,
    target_fps: u32,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    frame_count: u64,
    error_count: u64,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegSource {
    pub fn new(url: impl Into<String>, target_fps: u32) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Self {
            url: url.into(),
            target_fps,
            agent,
            stream: None,
            last_frame_at: None,
            connected_at: None,
            frame_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    /// Count the failure and drop the stream so the next capture reconnects.
    fn record_error(&mut self, err: anyhow::Error) -> anyhow::Error {
        self.error_count += 1;
        self.last_error = Some(err.to_string());
        self.stream = None;
        err
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        let min_interval = frame_interval(self.target_fps);
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| anyhow!("mjpeg source not connected; call connect() first"))?;
            match stream {
                HttpStream::Mjpeg(stream) => {
                    let jpeg = stream.read_next_jpeg()?;
                    // Drain frames the camera sends faster than the target rate.
                    if let Some(last) = self.last_frame_at {
                        if last.elapsed() < min_interval {
                            continue;
                        }
                    }
                    return Ok(jpeg);
                }
                HttpStream::SingleJpeg => {
                    if let Some(last) = self.last_frame_at {
                        let elapsed = last.elapsed();
                        if elapsed < min_interval {
                            thread::sleep(min_interval - elapsed);
                        }
                    }
                    return fetch_single_jpeg(&self.agent, &self.url);
                }
            }
        }
    }
}

impl FrameSource for MjpegSource {
    fn name(&self) -> &str {
        "mjpeg"
    }

    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to camera {}", self.url))?;
        let content_type = response
            .header("Content-Type")
            .unwrap_or("")
            .to_string();
        if content_type.to_lowercase().contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("MjpegSource: connected to {} ({})", self.url, content_type);
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        if self.stream.is_none() {
            if let Err(err) = self.connect() {
                return Err(self.record_error(err));
            }
        }
        let jpeg = match self.next_jpeg() {
            Ok(jpeg) => jpeg,
            Err(err) => return Err(self.record_error(err)),
        };
        let frame = match Frame::decode_jpeg(&jpeg, self.frame_count + 1) {
            Ok(frame) => frame,
            Err(err) => {
                self.error_count += 1;
                self.last_error = Some(err.to_string());
                return Err(err);
            }
        };
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        self.last_error = None;
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let grace = health_grace(self.target_fps);
        match self.last_frame_at {
            Some(last_frame_at) => last_frame_at.elapsed() <= grace,
            None => connected_at.elapsed() <= grace,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            capture_errors: self.error_count,
            source: self.url.clone(),
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

/// Byte range of the first complete JPEG (SOI through EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
