use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use helmet_gate::config::GateConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "HELMET_GATE_CONFIG",
        "HELMET_GATE_ADDR",
        "HELMET_GATE_CAMERA_URL",
        "HELMET_GATE_DETECTOR",
        "HELMET_GATE_MODEL_PATH",
        "HELMET_GATE_CONFIDENCE",
        "HELMET_GATE_BACKEND_URL",
        "HELMET_GATE_ACTUATOR",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = GateConfig::load().expect("load defaults");
    assert_eq!(cfg.server.addr, "0.0.0.0:8000");
    assert_eq!(cfg.camera.url, "stub://camera");
    assert_eq!(cfg.detector.backend, "color");
    assert_eq!(cfg.detector.target_label, "helmet");
    assert!((cfg.detector.confidence_threshold - 0.35).abs() < f32::EPSILON);
    assert_eq!(cfg.gate.open_angle, 90);
    assert_eq!(cfg.gate.closed_angle, 0);
    assert_eq!(cfg.gate.dwell, Duration::from_secs(3));
    assert_eq!(cfg.servo.device, "stub://servo");
    assert!(cfg.reporter.backend_url.is_none());
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "server": { "addr": "127.0.0.1:9000", "max_streams": 4 },
            "camera": { "url": "http://camera.local/stream", "width": 640, "height": 480, "target_fps": 5 },
            "detector": { "backend": "tract", "model_path": "/opt/models/helmet.onnx", "confidence": 0.5, "target_label": " Helmet " },
            "gate": { "open_angle": 120, "closed_angle": 10, "dwell_secs": 5 },
            "reporter": { "backend_url": "http://logs.local:4000/", "timeout_secs": 2 }
        }"#,
    );

    std::env::set_var("HELMET_GATE_CONFIG", file.path());
    std::env::set_var("HELMET_GATE_CAMERA_URL", "stub://camera?period=4");
    std::env::set_var("HELMET_GATE_CONFIDENCE", "0.6");

    let cfg = GateConfig::load().expect("load config");
    clear_env();

    assert_eq!(cfg.server.addr, "127.0.0.1:9000");
    assert_eq!(cfg.server.max_streams, 4);
    assert_eq!(cfg.camera.url, "stub://camera?period=4");
    assert_eq!((cfg.camera.width, cfg.camera.height), (640, 480));
    assert_eq!(cfg.camera.target_fps, 5);
    assert_eq!(cfg.detector.backend, "tract");
    assert_eq!(
        cfg.detector.model_path,
        PathBuf::from("/opt/models/helmet.onnx")
    );
    assert!((cfg.detector.confidence_threshold - 0.6).abs() < 1e-6);
    assert_eq!(cfg.detector.target_label, "helmet");
    assert_eq!(cfg.gate.open_angle, 120);
    assert_eq!(cfg.gate.closed_angle, 10);
    assert_eq!(cfg.gate.dwell, Duration::from_secs(5));
    assert_eq!(
        cfg.reporter.backend_url.as_deref(),
        Some("http://logs.local:4000")
    );
    assert_eq!(cfg.reporter.timeout, Duration::from_secs(2));
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
[server]
addr = "127.0.0.1:8100"
stream_poll_ms = 50

[servo]
device = "/sys/class/pwm/pwmchip0"
channel = 1
settle_ms = 250

[pipeline]
cycle_sleep_ms = 20
jpeg_quality = 70
"#,
    );

    let cfg = GateConfig::load_from(Some(file.path())).expect("load toml config");
    assert_eq!(cfg.server.addr, "127.0.0.1:8100");
    assert_eq!(cfg.server.stream_poll, Duration::from_millis(50));
    assert_eq!(cfg.servo.device, "/sys/class/pwm/pwmchip0");
    assert_eq!(cfg.servo.channel, 1);
    assert_eq!(cfg.servo.settle, Duration::from_millis(250));
    assert_eq!(cfg.pipeline.cycle_sleep, Duration::from_millis(20));
    assert_eq!(cfg.pipeline.jpeg_quality, 70);
}

#[test]
fn rejects_out_of_range_confidence() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(".json", r#"{ "detector": { "confidence": 1.5 } }"#);
    let err = GateConfig::load_from(Some(file.path())).expect_err("confidence rejected");
    assert!(err.to_string().contains("outside [0, 1]"));

    std::env::set_var("HELMET_GATE_CONFIDENCE", "high");
    let err = GateConfig::load_from(None).expect_err("non-numeric confidence rejected");
    clear_env();
    assert!(err.to_string().contains("HELMET_GATE_CONFIDENCE"));
}

#[test]
fn rejects_non_http_backend_url() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("HELMET_GATE_BACKEND_URL", "ftp://logs.local");
    let err = GateConfig::load_from(None).expect_err("ftp rejected");
    assert!(err.to_string().contains("must be http(s)"));

    std::env::set_var("HELMET_GATE_BACKEND_URL", "not a url");
    let err = GateConfig::load_from(None).expect_err("garbage rejected");
    clear_env();
    assert!(err.to_string().contains("invalid backend url"));
}

#[test]
fn rejects_inverted_servo_pulse_range() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{ "servo": { "min_pulse_us": 2500, "max_pulse_us": 500 } }"#,
    );
    let err = GateConfig::load_from(Some(file.path())).expect_err("pulse range rejected");
    assert!(err.to_string().contains("min pulse must be below max pulse"));
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let err = GateConfig::load_from(Some(&dir.path().join("absent.json")))
        .expect_err("missing file rejected");
    assert!(err.to_string().contains("failed to read config file"));
}
