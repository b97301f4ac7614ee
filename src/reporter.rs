//! Gate event reporting to the remote log backend.
//!
//! Reporting is best effort. The gate controller hands events to a bounded queue and
//! returns immediately; one worker thread uploads the snapshot and posts the log
//! entry with a bounded timeout and a single attempt. A slow or unreachable backend
//! therefore never stalls detection or actuation.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use rand::RngCore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::ReporterSettings;
use crate::frame::Frame;

/// Keys the backend may use for the stored image reference, in preference order.
const IMAGE_REF_KEYS: [&str; 4] = ["url", "image_url", "file_url", "path"];

/// A gate transition worth logging remotely.
#[derive(Clone, Debug)]
pub struct GateEvent {
    /// Full-resolution frame that triggered the transition.
    pub frame: Frame,
    pub opened: bool,
    pub at: DateTime<Local>,
}

impl GateEvent {
    pub fn new(frame: Frame, opened: bool) -> Self {
        Self {
            frame,
            opened,
            at: Local::now(),
        }
    }
}

/// Fire-and-forget event sink.
pub trait EventReporter: Send + Sync {
    /// Queue an event. Must not block on network I/O.
    fn report(&self, event: GateEvent);
}

/// Reporter used when no backend is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullReporter;

impl EventReporter for NullReporter {
    fn report(&self, event: GateEvent) {
        log::debug!(
            "reporting disabled; dropping gate event (opened={})",
            event.opened
        );
    }
}

#[derive(Debug, Default)]
struct ReporterStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Queue-backed HTTP reporter with a single delivery worker.
pub struct HttpEventReporter {
    sender: Mutex<Option<SyncSender<GateEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ReporterStats>,
}

impl HttpEventReporter {
    /// Start the delivery worker for `backend_url`.
    pub fn spawn(backend_url: &str, settings: &ReporterSettings) -> Result<Self> {
        let client = BackendClient::new(backend_url, settings)?;
        let (sender, receiver) = mpsc::sync_channel(settings.queue_capacity);
        let stats = Arc::new(ReporterStats::default());
        let worker_stats = stats.clone();
        let worker = std::thread::Builder::new()
            .name("event-reporter".to_string())
            .spawn(move || run_worker(client, receiver, worker_stats))
            .context("spawn event reporter thread")?;
        log::info!(
            "event reporter: posting to {} (timeout {:?}, queue {})",
            backend_url,
            settings.timeout,
            settings.queue_capacity
        );
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            stats,
        })
    }

    pub fn delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the worker to finish in-flight deliveries.
    pub fn shutdown(&self) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| anyhow!("reporter sender lock poisoned"))?
            .take();
        drop(sender);
        let worker = self
            .worker
            .lock()
            .map_err(|_| anyhow!("reporter worker lock poisoned"))?
            .take();
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| anyhow!("event reporter thread panicked"))?;
        }
        Ok(())
    }
}

impl EventReporter for HttpEventReporter {
    fn report(&self, event: GateEvent) {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::error!("reporter sender lock poisoned; dropping event");
                return;
            }
        };
        let Some(sender) = guard.as_ref() else {
            log::warn!("event reporter stopped; dropping event");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("event reporter queue full; dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("event reporter worker gone; dropping event");
            }
        }
    }
}

fn run_worker(client: BackendClient, receiver: Receiver<GateEvent>, stats: Arc<ReporterStats>) {
    for event in receiver {
        match client.deliver(&event) {
            Ok(true) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("event report failed: {:#}", err);
            }
        }
    }
    log::debug!("event reporter worker exiting");
}

#[derive(Serialize)]
struct LogEntry<'a> {
    image: &'a str,
    #[serde(rename = "isOpen")]
    is_open: bool,
}

struct BackendClient {
    agent: ureq::Agent,
    base_url: String,
    jpeg_quality: u8,
}

impl BackendClient {
    fn new(base_url: &str, settings: &ReporterSettings) -> Result<Self> {
        let parsed = url::Url::parse(base_url).context("parse backend url")?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("unsupported backend scheme '{}'", parsed.scheme()));
        }
        Ok(Self {
            agent: ureq::AgentBuilder::new().timeout(settings.timeout).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            jpeg_quality: settings.jpeg_quality,
        })
    }

    /// Upload the snapshot, then post the log entry. Returns `Ok(false)` when the
    /// upload produced no image reference and the log post was skipped.
    fn deliver(&self, event: &GateEvent) -> Result<bool> {
        let jpeg = event.frame.encode_jpeg(self.jpeg_quality)?;
        let Some(image_ref) = self.upload_image(&jpeg)? else {
            log::warn!("backend upload returned no image reference; skipping log entry");
            return Ok(false);
        };
        log::info!("uploaded gate snapshot: {}", image_ref);
        self.send_log(&image_ref, event.opened)?;
        log::info!("gate event logged (isOpen={})", event.opened);
        Ok(true)
    }

    fn upload_image(&self, jpeg: &[u8]) -> Result<Option<String>> {
        let boundary = multipart_boundary();
        let body = multipart_file_body(&boundary, "file", "image.jpg", "image/jpeg", jpeg);
        let response = self
            .agent
            .post(&format!("{}/upload", self.base_url))
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&body)
            .map_err(|e| anyhow!("upload request failed: {}", e))?;
        let text = response.into_string().context("read upload response")?;
        Ok(extract_image_ref(&text))
    }

    fn send_log(&self, image_ref: &str, is_open: bool) -> Result<()> {
        let payload = serde_json::to_string(&LogEntry {
            image: image_ref,
            is_open,
        })?;
        self.agent
            .post(&format!("{}/logs", self.base_url))
            .set("Content-Type", "application/json")
            .send_string(&payload)
            .map_err(|e| anyhow!("log request failed: {}", e))?;
        Ok(())
    }
}

fn multipart_boundary() -> String {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    format!("helmetgate{}", hex::encode(nonce))
}

fn multipart_file_body(
    boundary: &str,
    field: &str,
    filename: &str,
    content_type: &str,
    data: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// Pull the stored image reference out of an upload response body.
fn extract_image_ref(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    IMAGE_REF_KEYS.iter().find_map(|key| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
