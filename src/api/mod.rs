//! HTTP surface for operators and viewers.
//!
//! A small HTTP/1.1 server on `std::net`: a non-blocking accept loop hands every
//! connection to its own thread, so a long-lived MJPEG viewer never holds up a
//! status poll or a gate command.
//!
//! Routes:
//! - `GET /stream.mjpg`: `multipart/x-mixed-replace` live view
//! - `GET /snapshot.jpg`: latest annotated frame
//! - `GET /status`: camera/model/gate snapshot
//! - `POST /gate`: `{"action": "open" | "close"}`
//! - `GET /health`

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::ServerSettings;
use crate::gate::{GateCommand, GateController, GateState, GateStatus};
use crate::pipeline::RuntimeFlags;
use crate::publisher::{FramePublisher, PublishedFrame};

const MAX_REQUEST_BYTES: usize = 8192;
const BOUNDARY: &str = "FRAME";
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Concurrent `/stream.mjpg` viewers allowed before new ones get 503.
    pub max_streams: usize,
    /// How often a stream checks the publisher for a new frame.
    pub stream_poll: Duration,
    /// Reported by `/status`.
    pub confidence_threshold: f32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let server = ServerSettings::default();
        Self {
            addr: server.addr,
            max_streams: server.max_streams,
            stream_poll: server.stream_poll,
            confidence_threshold: 0.35,
        }
    }
}

impl ApiConfig {
    pub fn from_settings(server: &ServerSettings, confidence_threshold: f32) -> Self {
        Self {
            addr: server.addr.clone(),
            max_streams: server.max_streams,
            stream_poll: server.stream_poll,
            confidence_threshold,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Shared by the accept loop and every connection thread.
struct ApiState {
    cfg: ApiConfig,
    gate: Arc<GateController>,
    publisher: Arc<FramePublisher>,
    flags: Arc<RuntimeFlags>,
    active_streams: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

pub struct ApiServer {
    cfg: ApiConfig,
    gate: Arc<GateController>,
    publisher: Arc<FramePublisher>,
    flags: Arc<RuntimeFlags>,
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        gate: Arc<GateController>,
        publisher: Arc<FramePublisher>,
        flags: Arc<RuntimeFlags>,
    ) -> Self {
        Self {
            cfg,
            gate,
            publisher,
            flags,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(ApiState {
            cfg: self.cfg,
            gate: self.gate,
            publisher: self.publisher,
            flags: self.flags,
            active_streams: AtomicUsize::new(0),
            shutdown: shutdown.clone(),
        });
        let join = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, state) {
                    log::error!("http server stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: Arc<ApiState>) -> Result<()> {
    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                let spawned = std::thread::Builder::new()
                    .name("http-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &state) {
                            log::debug!("http request from {} ended: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("failed to spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    is_online: bool,
    gate_status: GateState,
    model_loaded: bool,
    manual_mode: bool,
    confidence_threshold: f32,
}

#[derive(Debug, Deserialize)]
struct GateRequest {
    action: String,
}

#[derive(Debug, Serialize)]
struct GateResponse {
    success: bool,
    message: String,
    gate_status: GateState,
    manual_mode: bool,
}

impl GateResponse {
    fn rejected(message: String, status: GateStatus) -> Self {
        Self {
            success: false,
            message,
            gate_status: status.state,
            manual_mode: status.manual_override,
        }
    }
}

fn handle_connection(mut stream: TcpStream, state: &ApiState) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            // Discard the unread remainder so closing does not reset the connection
            // before the client has read the response.
            let _ = stream.shutdown(Shutdown::Write);
            let _ = std::io::copy(&mut (&stream).take(64 * 1024), &mut std::io::sink());
            return Err(err);
        }
    };

    if request.method == "OPTIONS" {
        return write_response(&mut stream, 204, "text/plain", &[]);
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/stream.mjpg") => serve_stream(stream, state),
        ("GET", "/snapshot.jpg") => match state.publisher.latest()? {
            Some(frame) => write_response(&mut stream, 200, "image/jpeg", &frame.jpeg),
            None => write_json_response(&mut stream, 503, r#"{"error":"no_frame_yet"}"#),
        },
        ("GET", "/status") => {
            let gate = state.gate.status()?;
            let body = StatusResponse {
                is_online: state.flags.camera_online(),
                gate_status: gate.state,
                model_loaded: state.flags.model_loaded(),
                manual_mode: gate.manual_override,
                confidence_threshold: state.cfg.confidence_threshold,
            };
            write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&body)?)
        }
        ("POST", "/gate") => {
            let (status, body) = gate_command(state, &request.body)?;
            write_response(&mut stream, status, "application/json", &serde_json::to_vec(&body)?)
        }
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        (_, "/stream.mjpg" | "/snapshot.jpg" | "/status" | "/gate" | "/health") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn gate_command(state: &ApiState, body: &[u8]) -> Result<(u16, GateResponse)> {
    let request: GateRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            let current = state.gate.status()?;
            return Ok((
                400,
                GateResponse::rejected(format!("Invalid request body: {}", err), current),
            ));
        }
    };
    let command: GateCommand = match request.action.parse() {
        Ok(command) => command,
        Err(_) => {
            let current = state.gate.status()?;
            return Ok((
                200,
                GateResponse::rejected(
                    "Invalid action. Use 'open' or 'close'".to_string(),
                    current,
                ),
            ));
        }
    };
    let status = state.gate.apply_manual_command(command)?;
    let message = match command {
        GateCommand::Open => "Gate opened",
        GateCommand::Close => "Gate closed",
    };
    Ok((
        200,
        GateResponse {
            success: true,
            message: message.to_string(),
            gate_status: status.state,
            manual_mode: status.manual_override,
        },
    ))
}

/// Decrements the live stream count when a viewer goes away.
struct StreamSlot<'a>(&'a AtomicUsize);

impl Drop for StreamSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn serve_stream(mut stream: TcpStream, state: &ApiState) -> Result<()> {
    let active = state.active_streams.fetch_add(1, Ordering::SeqCst) + 1;
    let _slot = StreamSlot(&state.active_streams);
    if active > state.cfg.max_streams {
        return write_json_response(&mut stream, 503, r#"{"error":"too_many_streams"}"#);
    }

    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\n\
         Cache-Control: no-cache, private\r\nPragma: no-cache\r\n\
         Access-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    log::debug!("stream viewer connected ({} active)", active);

    let mut last_sent = 0u64;
    while !state.shutdown.load(Ordering::SeqCst) {
        if let Some(frame) = state.publisher.latest()? {
            if frame.sequence != last_sent {
                write_part(&mut stream, &frame)?;
                last_sent = frame.sequence;
            }
        }
        // Without new frames no write ever fails, so look for the hang-up directly.
        if peer_closed(&stream)? {
            log::debug!("stream viewer disconnected");
            break;
        }
        std::thread::sleep(state.cfg.stream_poll);
    }
    Ok(())
}

/// True once the client has closed or reset its side of the connection.
fn peer_closed(stream: &TcpStream) -> Result<bool> {
    let mut byte = [0u8; 1];
    stream.set_nonblocking(true)?;
    let closed = match stream.peek(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    stream.set_nonblocking(false)?;
    Ok(closed)
}

fn write_part(stream: &mut TcpStream, frame: &PublishedFrame) -> Result<()> {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.jpeg.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(&frame.jpeg)?;
    stream.write_all(b"\r\n")?;
    stream.flush()?;
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            if pos + 4 > MAX_REQUEST_BYTES {
                return Err(anyhow!("request too large"));
            }
            break pos + 4;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..head_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\n\
         Cache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
