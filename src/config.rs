use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_MAX_STREAMS: usize = 16;
const DEFAULT_STREAM_POLL_MS: u64 = 33;
const DEFAULT_CAMERA_URL: &str = "stub://camera";
const DEFAULT_CAMERA_WIDTH: u32 = 1280;
const DEFAULT_CAMERA_HEIGHT: u32 = 720;
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_DETECTOR: &str = "color";
const DEFAULT_MODEL_PATH: &str = "helmet.onnx";
const DEFAULT_INPUT_SIZE: u32 = 320;
const DEFAULT_CONFIDENCE: f32 = 0.35;
const DEFAULT_TARGET_LABEL: &str = "helmet";
const DEFAULT_OPEN_ANGLE: u8 = 90;
const DEFAULT_CLOSED_ANGLE: u8 = 0;
const DEFAULT_DWELL_SECS: u64 = 3;
const DEFAULT_SERVO_DEVICE: &str = "stub://servo";
const DEFAULT_MIN_PULSE_US: u32 = 500;
const DEFAULT_MAX_PULSE_US: u32 = 2500;
const DEFAULT_PERIOD_US: u32 = 20_000;
const DEFAULT_SETTLE_MS: u64 = 500;
const DEFAULT_REPORT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_REPORT_QUEUE: usize = 8;
const DEFAULT_UPLOAD_QUALITY: u8 = 90;
const DEFAULT_CYCLE_SLEEP_MS: u64 = 100;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 1000;
const DEFAULT_STREAM_QUALITY: u8 = 85;

#[derive(Debug, Deserialize, Default)]
struct GateConfigFile {
    server: Option<ServerConfigFile>,
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    gate: Option<GateConfigSection>,
    servo: Option<ServoConfigFile>,
    reporter: Option<ReporterConfigFile>,
    pipeline: Option<PipelineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
    max_streams: Option<usize>,
    stream_poll_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    target_label: Option<String>,
    labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct GateConfigSection {
    open_angle: Option<u8>,
    closed_angle: Option<u8>,
    dwell_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServoConfigFile {
    device: Option<String>,
    channel: Option<u32>,
    min_pulse_us: Option<u32>,
    max_pulse_us: Option<u32>,
    period_us: Option<u32>,
    settle_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReporterConfigFile {
    backend_url: Option<String>,
    timeout_secs: Option<u64>,
    queue_capacity: Option<usize>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    cycle_sleep_ms: Option<u64>,
    error_backoff_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    pub server: ServerSettings,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub gate: GateSettings,
    pub servo: ServoSettings,
    pub reporter: ReporterSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: String,
    pub max_streams: usize,
    pub stream_poll: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_SERVER_ADDR.to_string(),
            max_streams: DEFAULT_MAX_STREAMS,
            stream_poll: Duration::from_millis(DEFAULT_STREAM_POLL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// `stub://...`, `http(s)://...` or a V4L2 device path.
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CAMERA_URL.to_string(),
            width: DEFAULT_CAMERA_WIDTH,
            height: DEFAULT_CAMERA_HEIGHT,
            target_fps: DEFAULT_CAMERA_FPS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: PathBuf,
    /// Square input edge the frame is downscaled to.
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub target_label: String,
    /// Class index to label mapping for model backends.
    pub labels: Vec<String>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE,
            target_label: DEFAULT_TARGET_LABEL.to_string(),
            labels: vec![DEFAULT_TARGET_LABEL.to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub open_angle: u8,
    pub closed_angle: u8,
    /// Minimum time the gate stays open after an automatic open.
    pub dwell: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            open_angle: DEFAULT_OPEN_ANGLE,
            closed_angle: DEFAULT_CLOSED_ANGLE,
            dwell: Duration::from_secs(DEFAULT_DWELL_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServoSettings {
    /// `stub://...` or a sysfs PWM chip directory such as `/sys/class/pwm/pwmchip0`.
    pub device: String,
    pub channel: u32,
    pub min_pulse_us: u32,
    pub max_pulse_us: u32,
    pub period_us: u32,
    pub settle: Duration,
}

impl Default for ServoSettings {
    fn default() -> Self {
        Self {
            device: DEFAULT_SERVO_DEVICE.to_string(),
            channel: 0,
            min_pulse_us: DEFAULT_MIN_PULSE_US,
            max_pulse_us: DEFAULT_MAX_PULSE_US,
            period_us: DEFAULT_PERIOD_US,
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReporterSettings {
    /// Event backend base URL. Reporting is disabled when unset.
    pub backend_url: Option<String>,
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub jpeg_quality: u8,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            backend_url: None,
            timeout: Duration::from_secs(DEFAULT_REPORT_TIMEOUT_SECS),
            queue_capacity: DEFAULT_REPORT_QUEUE,
            jpeg_quality: DEFAULT_UPLOAD_QUALITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cycle_sleep: Duration,
    pub error_backoff: Duration,
    pub jpeg_quality: u8,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cycle_sleep: Duration::from_millis(DEFAULT_CYCLE_SLEEP_MS),
            error_backoff: Duration::from_millis(DEFAULT_ERROR_BACKOFF_MS),
            jpeg_quality: DEFAULT_STREAM_QUALITY,
        }
    }
}

impl GateConfig {
    /// Load from `HELMET_GATE_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("HELMET_GATE_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (if any), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => GateConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GateConfigFile) -> Self {
        let server = file.server.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let gate = file.gate.unwrap_or_default();
        let servo = file.servo.unwrap_or_default();
        let reporter = file.reporter.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();

        let target_label = detector
            .target_label
            .unwrap_or_else(|| DEFAULT_TARGET_LABEL.to_string());
        Self {
            server: ServerSettings {
                addr: server
                    .addr
                    .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string()),
                max_streams: server.max_streams.unwrap_or(DEFAULT_MAX_STREAMS),
                stream_poll: Duration::from_millis(
                    server.stream_poll_ms.unwrap_or(DEFAULT_STREAM_POLL_MS),
                ),
            },
            camera: CameraSettings {
                url: camera.url.unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                target_fps: camera.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
            },
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                confidence_threshold: detector.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                labels: detector
                    .labels
                    .unwrap_or_else(|| vec![target_label.clone()]),
                target_label,
            },
            gate: GateSettings {
                open_angle: gate.open_angle.unwrap_or(DEFAULT_OPEN_ANGLE),
                closed_angle: gate.closed_angle.unwrap_or(DEFAULT_CLOSED_ANGLE),
                dwell: Duration::from_secs(gate.dwell_secs.unwrap_or(DEFAULT_DWELL_SECS)),
            },
            servo: ServoSettings {
                device: servo
                    .device
                    .unwrap_or_else(|| DEFAULT_SERVO_DEVICE.to_string()),
                channel: servo.channel.unwrap_or(0),
                min_pulse_us: servo.min_pulse_us.unwrap_or(DEFAULT_MIN_PULSE_US),
                max_pulse_us: servo.max_pulse_us.unwrap_or(DEFAULT_MAX_PULSE_US),
                period_us: servo.period_us.unwrap_or(DEFAULT_PERIOD_US),
                settle: Duration::from_millis(servo.settle_ms.unwrap_or(DEFAULT_SETTLE_MS)),
            },
            reporter: ReporterSettings {
                backend_url: reporter.backend_url.filter(|u| !u.trim().is_empty()),
                timeout: Duration::from_secs(
                    reporter.timeout_secs.unwrap_or(DEFAULT_REPORT_TIMEOUT_SECS),
                ),
                queue_capacity: reporter.queue_capacity.unwrap_or(DEFAULT_REPORT_QUEUE),
                jpeg_quality: reporter.jpeg_quality.unwrap_or(DEFAULT_UPLOAD_QUALITY),
            },
            pipeline: PipelineSettings {
                cycle_sleep: Duration::from_millis(
                    pipeline.cycle_sleep_ms.unwrap_or(DEFAULT_CYCLE_SLEEP_MS),
                ),
                error_backoff: Duration::from_millis(
                    pipeline.error_backoff_ms.unwrap_or(DEFAULT_ERROR_BACKOFF_MS),
                ),
                jpeg_quality: pipeline.jpeg_quality.unwrap_or(DEFAULT_STREAM_QUALITY),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("HELMET_GATE_ADDR") {
            self.server.addr = addr;
        }
        if let Some(url) = non_empty_env("HELMET_GATE_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(backend) = non_empty_env("HELMET_GATE_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = non_empty_env("HELMET_GATE_MODEL_PATH") {
            self.detector.model_path = PathBuf::from(path);
        }
        if let Some(conf) = non_empty_env("HELMET_GATE_CONFIDENCE") {
            self.detector.confidence_threshold = conf
                .parse()
                .map_err(|_| anyhow!("HELMET_GATE_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Some(url) = non_empty_env("HELMET_GATE_BACKEND_URL") {
            self.reporter.backend_url = Some(url);
        }
        if let Some(device) = non_empty_env("HELMET_GATE_ACTUATOR") {
            self.servo.device = device;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let conf = self.detector.confidence_threshold;
        if !(0.0..=1.0).contains(&conf) {
            return Err(anyhow!("confidence threshold {} outside [0, 1]", conf));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera dimensions must be non-zero"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input size must be non-zero"));
        }
        if self.detector.target_label.trim().is_empty() {
            return Err(anyhow!("detector target label must not be empty"));
        }
        self.detector.target_label = self.detector.target_label.trim().to_lowercase();
        if self.gate.open_angle > 180 || self.gate.closed_angle > 180 {
            return Err(anyhow!("gate angles must be within 0..=180"));
        }
        if self.servo.min_pulse_us >= self.servo.max_pulse_us {
            return Err(anyhow!("servo min pulse must be below max pulse"));
        }
        if self.servo.max_pulse_us >= self.servo.period_us {
            return Err(anyhow!("servo max pulse must fit within the PWM period"));
        }
        if self.reporter.timeout.is_zero() {
            return Err(anyhow!("reporter timeout must be greater than zero"));
        }
        if self.reporter.queue_capacity == 0 {
            return Err(anyhow!("reporter queue capacity must be greater than zero"));
        }
        if self.server.max_streams == 0 {
            return Err(anyhow!("max_streams must be greater than zero"));
        }
        if let Some(url) = &self.reporter.backend_url {
            let parsed = url::Url::parse(url)
                .map_err(|e| anyhow!("invalid backend url '{}': {}", url, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow!("backend url must be http(s), got '{}'", url));
            }
            self.reporter.backend_url = Some(url.trim_end_matches('/').to_string());
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<GateConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
