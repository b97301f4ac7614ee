//! helmet_gated - helmet-detection gate daemon
//!
//! This daemon:
//! 1. Drives the gate closed and loads the detector
//! 2. Connects the camera and starts the frame processing loop
//! 3. Serves the MJPEG stream, status and gate control over HTTP
//! 4. Reports automatic openings to the log backend (when configured)
//!
//! On Ctrl-C the HTTP server and loop are stopped and the gate is closed.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use helmet_gate::{
    api::{ApiConfig, ApiServer},
    load_detector, open_actuator, open_source, EventReporter, FrameLoop, FramePublisher,
    GateConfig, GateController, HttpEventReporter, NullReporter, RuntimeFlags,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Helmet-detection gate controller")]
struct Args {
    /// Configuration file (TOML when the extension is .toml, JSON otherwise).
    #[arg(long, env = "HELMET_GATE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, e.g. 0.0.0.0:8000.
    #[arg(long, env = "HELMET_GATE_ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = GateConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        cfg.server.addr = addr;
    }

    // The gate must be physically closed before anything can open it.
    let mut actuator = open_actuator(&cfg.servo)?;
    if let Err(err) = actuator.set_position(cfg.gate.closed_angle) {
        log::warn!("initial close on {} failed: {:#}", actuator.name(), err);
    }

    let detector = load_detector(&cfg.detector)?;
    log::info!(
        "detector {} (input {}x{}, threshold {:.2}, label '{}')",
        detector.name(),
        cfg.detector.input_size,
        cfg.detector.input_size,
        cfg.detector.confidence_threshold,
        cfg.detector.target_label
    );

    let mut source = open_source(&cfg.camera)?;
    if let Err(err) = source.connect() {
        // The loop keeps retrying; /status reports the camera offline meanwhile.
        log::error!("camera {} not available yet: {:#}", cfg.camera.url, err);
    }

    let http_reporter = match &cfg.reporter.backend_url {
        Some(url) => Some(Arc::new(HttpEventReporter::spawn(url, &cfg.reporter)?)),
        None => {
            log::warn!("no backend url configured; gate events will not be reported");
            None
        }
    };
    let reporter: Arc<dyn EventReporter> = match &http_reporter {
        Some(reporter) => reporter.clone(),
        None => Arc::new(NullReporter),
    };

    let gate = Arc::new(
        GateController::new(actuator, reporter, cfg.gate.clone())
            .with_target_label(cfg.detector.target_label.clone()),
    );
    let publisher = Arc::new(FramePublisher::new());
    let flags = Arc::new(RuntimeFlags::new());

    let mut frame_loop = FrameLoop::new(
        source,
        detector,
        gate.clone(),
        publisher.clone(),
        flags.clone(),
        cfg.pipeline.clone(),
        cfg.detector.confidence_threshold,
    );
    frame_loop.warm_up();
    let loop_handle = frame_loop.spawn()?;

    let api_config = ApiConfig::from_settings(&cfg.server, cfg.detector.confidence_threshold);
    let api_handle = ApiServer::new(api_config, gate.clone(), publisher, flags).spawn()?;
    log::info!("http api listening on {}", api_handle.addr);
    log::info!("stream url: http://{}/stream.mjpg", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("helmet_gated running; waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    api_handle.stop()?;
    loop_handle.stop()?;
    gate.shutdown()?;
    if let Some(reporter) = http_reporter {
        reporter.shutdown()?;
        log::info!(
            "event reporter: {} delivered, {} failed, {} dropped",
            reporter.delivered(),
            reporter.failed(),
            reporter.dropped()
        );
    }
    log::info!("helmet_gated stopped");
    Ok(())
}
