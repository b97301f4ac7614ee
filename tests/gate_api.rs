use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use helmet_gate::api::{ApiConfig, ApiHandle, ApiServer};
use helmet_gate::config::GateSettings;
use helmet_gate::{
    Frame, FramePublisher, GateController, GateState, NullReporter, RuntimeFlags, StubActuator,
};

struct TestApi {
    api_handle: Option<ApiHandle>,
    gate: Arc<GateController>,
    publisher: Arc<FramePublisher>,
    flags: Arc<RuntimeFlags>,
    actuator: StubActuator,
}

impl TestApi {
    fn new() -> Result<Self> {
        Self::with_config(ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            stream_poll: Duration::from_millis(5),
            ..ApiConfig::default()
        })
    }

    fn with_config(api_config: ApiConfig) -> Result<Self> {
        let actuator = StubActuator::new();
        let gate = Arc::new(GateController::new(
            Box::new(actuator.clone()),
            Arc::new(NullReporter),
            GateSettings::default(),
        ));
        let publisher = Arc::new(FramePublisher::new());
        let flags = Arc::new(RuntimeFlags::new());
        let api_handle =
            ApiServer::new(api_config, gate.clone(), publisher.clone(), flags.clone()).spawn()?;
        Ok(Self {
            api_handle: Some(api_handle),
            gate,
            publisher,
            flags,
            actuator,
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, raw: &str) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.write_all(raw.as_bytes())?;
        read_response(&mut stream)
    }

    fn post_gate(&self, body: &str) -> Result<(String, Value)> {
        let raw = format!(
            "POST /gate HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let (headers, body) = self.request(&raw)?;
        Ok((headers, serde_json::from_str(&body)?))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn test_jpeg(shade: u8) -> Vec<u8> {
    Frame::from_rgb(vec![shade; 32 * 24 * 3], 32, 24, 1)
        .unwrap()
        .encode_jpeg(80)
        .unwrap()
}

/// Read from `stream` until `buf` holds at least `len` bytes.
fn fill_to(stream: &mut TcpStream, buf: &mut Vec<u8>, len: usize) -> Result<()> {
    let mut chunk = [0u8; 4096];
    while buf.len() < len {
        let n = stream.read(&mut chunk)?;
        anyhow::ensure!(n > 0, "stream closed early");
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

/// Read until `marker` appears at or after `from`; returns the offset just past it.
fn read_until(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    from: usize,
    marker: &[u8],
) -> Result<usize> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = buf[from..].windows(marker.len()).position(|w| w == marker) {
            return Ok(from + pos + marker.len());
        }
        let n = stream.read(&mut chunk)?;
        anyhow::ensure!(n > 0, "stream closed early");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Reads one multipart part starting at `offset`; returns (jpeg, next offset).
fn read_part(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    offset: usize,
) -> Result<(Vec<u8>, usize)> {
    let head_end = read_until(stream, buf, offset, b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&buf[offset..head_end]).to_string();
    assert!(head.starts_with("--FRAME\r\n"), "unexpected part head: {head}");
    assert!(head.contains("Content-Type: image/jpeg"));
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .expect("part content length")
        .trim()
        .parse()?;
    fill_to(stream, buf, head_end + len + 2)?;
    assert_eq!(&buf[head_end + len..head_end + len + 2], b"\r\n");
    Ok((buf[head_end..head_end + len].to_vec(), head_end + len + 2))
}

#[test]
fn status_reports_gate_and_runtime_flags() -> Result<()> {
    let api = TestApi::new()?;
    api.flags.set_model_loaded(true);

    let (headers, body) = api.request("GET /status HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Access-Control-Allow-Origin: *"));

    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["is_online"], false);
    assert_eq!(value["gate_status"], "closed");
    assert_eq!(value["model_loaded"], true);
    assert_eq!(value["manual_mode"], false);
    assert!((value["confidence_threshold"].as_f64().unwrap() - 0.35).abs() < 1e-6);
    Ok(())
}

#[test]
fn manual_open_then_close_round_trip() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, value) = api.post_gate(r#"{"action":"open"}"#)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(value["success"], true);
    assert_eq!(value["message"], "Gate opened");
    assert_eq!(value["gate_status"], "open");
    assert_eq!(value["manual_mode"], true);

    let (_, status) = api.request("GET /status HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let status: Value = serde_json::from_str(&status)?;
    assert_eq!(status["gate_status"], "open");
    assert_eq!(status["manual_mode"], true);

    let (_, value) = api.post_gate(r#"{"action":"Close"}"#)?;
    assert_eq!(value["success"], true);
    assert_eq!(value["gate_status"], "closed");
    assert_eq!(value["manual_mode"], false);

    assert_eq!(api.actuator.commands(), vec![90, 0]);
    assert_eq!(api.gate.status()?.state, GateState::Closed);
    Ok(())
}

#[test]
fn unknown_action_leaves_state_unchanged() -> Result<()> {
    let api = TestApi::new()?;
    api.post_gate(r#"{"action":"open"}"#)?;

    let (headers, value) = api.post_gate(r#"{"action":"toggle"}"#)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(value["success"], false);
    assert_eq!(value["message"], "Invalid action. Use 'open' or 'close'");
    assert_eq!(value["gate_status"], "open");
    assert_eq!(value["manual_mode"], true);
    assert_eq!(api.actuator.commands(), vec![90]);
    Ok(())
}

#[test]
fn malformed_gate_body_is_bad_request() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, value) = api.post_gate("{not json")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(value["success"], false);
    assert_eq!(value["gate_status"], "closed");
    assert!(api.actuator.commands().is_empty());
    Ok(())
}

#[test]
fn stream_sends_each_new_frame_once() -> Result<()> {
    let api = TestApi::new()?;
    let first = test_jpeg(20);
    api.publisher.publish(first.clone())?;

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /stream.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut buf = Vec::new();
    let head_end = read_until(&mut stream, &mut buf, 0, b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    assert!(head.contains("200 OK"));
    assert!(head.contains("multipart/x-mixed-replace; boundary=FRAME"));

    let (jpeg, next) = read_part(&mut stream, &mut buf, head_end)?;
    assert_eq!(jpeg, first);

    let second = test_jpeg(220);
    api.publisher.publish(second.clone())?;
    let (jpeg, _) = read_part(&mut stream, &mut buf, next)?;
    assert_eq!(jpeg, second);
    Ok(())
}

#[test]
fn streams_beyond_limit_are_rejected() -> Result<()> {
    let api = TestApi::with_config(ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        max_streams: 1,
        stream_poll: Duration::from_millis(5),
        ..ApiConfig::default()
    })?;

    let mut viewer = TcpStream::connect(api.handle().addr)?;
    viewer.set_read_timeout(Some(Duration::from_secs(5)))?;
    viewer.write_all(b"GET /stream.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut buf = Vec::new();
    read_until(&mut viewer, &mut buf, 0, b"\r\n\r\n")?;

    let (headers, body) = api.request("GET /stream.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("503 Service Unavailable"));
    assert!(body.contains("too_many_streams"));
    Ok(())
}

#[test]
fn departed_viewer_frees_its_slot_while_camera_is_stalled() -> Result<()> {
    let api = TestApi::with_config(ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        max_streams: 1,
        stream_poll: Duration::from_millis(5),
        ..ApiConfig::default()
    })?;
    api.publisher.publish(test_jpeg(60))?;

    {
        let mut viewer = TcpStream::connect(api.handle().addr)?;
        viewer.set_read_timeout(Some(Duration::from_secs(5)))?;
        viewer.write_all(b"GET /stream.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
        let mut buf = Vec::new();
        let head_end = read_until(&mut viewer, &mut buf, 0, b"\r\n\r\n")?;
        read_part(&mut viewer, &mut buf, head_end)?;
    }

    // No further frames are published; the slot must still come back.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut next = TcpStream::connect(api.handle().addr)?;
        next.set_read_timeout(Some(Duration::from_secs(5)))?;
        next.write_all(b"GET /stream.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
        let mut buf = Vec::new();
        let head_end = read_until(&mut next, &mut buf, 0, b"\r\n\r\n")?;
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        if head.contains("200 OK") {
            let (jpeg, _) = read_part(&mut next, &mut buf, head_end)?;
            assert_eq!(jpeg, test_jpeg(60));
            return Ok(());
        }
        assert!(head.contains("503"), "unexpected response: {head}");
        assert!(Instant::now() < deadline, "stream slot never released");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn snapshot_waits_for_first_frame() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.request("GET /snapshot.jpg HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("503 Service Unavailable"));

    api.publisher.publish(test_jpeg(128))?;
    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.write_all(b"GET /snapshot.jpg HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let text = String::from_utf8_lossy(&response);
    assert!(text.contains("200 OK"));
    assert!(text.contains("Content-Type: image/jpeg"));
    assert!(response.windows(2).any(|w| w == [0xFF, 0xD8]));
    Ok(())
}

#[test]
fn routing_errors_and_preflight() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.request("GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    assert!(body.contains(r#""status":"ok""#));

    let (headers, _) = api.request("GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("404 Not Found"));

    let (headers, _) = api.request("GET /gate HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = api.request("OPTIONS /gate HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("204 No Content"));
    assert!(headers.contains("Access-Control-Allow-Methods: GET, POST, OPTIONS"));
    Ok(())
}

#[test]
fn oversized_request_is_rejected() -> Result<()> {
    let api = TestApi::new()?;
    let filler = "a".repeat(9000);
    let raw = format!("GET /status HTTP/1.1\r\nHost: localhost\r\nX-Filler: {filler}\r\n\r\n");
    let (headers, _) = api.request(&raw)?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}
