//! The frame processing loop.
//!
//! One dedicated thread owns the camera and the detector and runs the cycle
//! capture → downscale → detect → gate → annotate → encode → publish, then sleeps.
//! A failed cycle is logged and followed by a longer backoff; the loop itself only
//! ends when its shutdown flag is raised.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PipelineSettings;
use crate::detect::{contains_label, Detection, Detector};
use crate::gate::{GateController, Transition};
use crate::ingest::FrameSource;
use crate::overlay::{annotate, OverlayStatus};
use crate::publisher::FramePublisher;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Liveness flags reported by `/status`.
#[derive(Debug, Default)]
pub struct RuntimeFlags {
    camera_online: AtomicBool,
    model_loaded: AtomicBool,
}

impl RuntimeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn camera_online(&self) -> bool {
        self.camera_online.load(Ordering::Relaxed)
    }

    pub fn set_camera_online(&self, online: bool) {
        self.camera_online.store(online, Ordering::Relaxed);
    }

    pub fn model_loaded(&self) -> bool {
        self.model_loaded.load(Ordering::Relaxed)
    }

    pub fn set_model_loaded(&self, loaded: bool) {
        self.model_loaded.store(loaded, Ordering::Relaxed);
    }
}

/// Outcome of one successful cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleReport {
    pub frame_sequence: u64,
    pub helmet_present: bool,
    pub transition: Option<Transition>,
    pub published_sequence: u64,
}

#[derive(Debug, Default)]
struct LoopStats {
    cycles: u64,
    failures: u64,
}

pub struct FrameLoop {
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    gate: Arc<GateController>,
    publisher: Arc<FramePublisher>,
    flags: Arc<RuntimeFlags>,
    settings: PipelineSettings,
    confidence_threshold: f32,
    warm_up_attempted: bool,
    stats: LoopStats,
}

impl FrameLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        gate: Arc<GateController>,
        publisher: Arc<FramePublisher>,
        flags: Arc<RuntimeFlags>,
        settings: PipelineSettings,
        confidence_threshold: f32,
    ) -> Self {
        Self {
            source,
            detector,
            gate,
            publisher,
            flags,
            settings,
            confidence_threshold,
            warm_up_attempted: false,
            stats: LoopStats::default(),
        }
    }

    /// Load the detector model. Only the first call does any work; a failure
    /// leaves `model_loaded` false and later cycles fail in `detect`.
    pub fn warm_up(&mut self) {
        if self.warm_up_attempted {
            return;
        }
        self.warm_up_attempted = true;
        match self.detector.warm_up() {
            Ok(()) => {
                self.flags.set_model_loaded(self.detector.is_ready());
                log::info!("detector {} ready", self.detector.name());
            }
            Err(err) => {
                self.flags.set_model_loaded(false);
                log::error!("detector {} failed to load: {:#}", self.detector.name(), err);
            }
        }
    }

    /// Run one full cycle without sleeping.
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        self.warm_up();

        let mut frame = match self.source.capture_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.flags.set_camera_online(false);
                return Err(err.context(format!("capture from {}", self.source.name())));
            }
        };
        self.flags.set_camera_online(true);

        let (width, height) = self.detector.input_size();
        let input = frame.resized(width, height);
        let detections: Vec<Detection> = self
            .detector
            .detect(&input)
            .with_context(|| format!("detector {}", self.detector.name()))?
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .collect();
        let helmet_present = contains_label(&detections, self.gate.target_label());

        let transition = self.gate.evaluate_detection(&detections, &frame)?;
        let status = self.gate.status()?;

        annotate(
            &mut frame,
            &OverlayStatus {
                helmet_present,
                confidence_threshold: self.confidence_threshold,
                gate_state: status.state,
                manual_override: status.manual_override,
            },
        );
        let jpeg = frame.encode_jpeg(self.settings.jpeg_quality)?;
        let published_sequence = self.publisher.publish(jpeg)?;

        Ok(CycleReport {
            frame_sequence: frame.sequence,
            helmet_present,
            transition,
            published_sequence,
        })
    }

    /// Cycle until `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        self.warm_up();
        let mut last_health_log = Instant::now();
        log::info!(
            "frame loop running (source={}, detector={}, threshold={:.2})",
            self.source.name(),
            self.detector.name(),
            self.confidence_threshold
        );

        while !shutdown.load(Ordering::SeqCst) {
            let pause = match self.run_cycle() {
                Ok(report) => {
                    self.stats.cycles += 1;
                    if let Some(transition) = report.transition {
                        log::debug!("frame {} caused {:?}", report.frame_sequence, transition);
                    }
                    self.settings.cycle_sleep
                }
                Err(err) => {
                    self.stats.failures += 1;
                    log::warn!("frame cycle failed: {:#}", err);
                    self.settings.error_backoff
                }
            };

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                self.log_health();
                last_health_log = Instant::now();
            }

            std::thread::sleep(pause);
        }
        log::info!(
            "frame loop stopped after {} cycles ({} failed)",
            self.stats.cycles,
            self.stats.failures
        );
    }

    fn log_health(&self) {
        let source = self.source.stats();
        let gate = self
            .gate
            .status()
            .map(|s| s.state.as_str())
            .unwrap_or("unknown");
        log::info!(
            "camera health={} frames={} errors={} source={} cycles={} failed={} gate={} published={}",
            self.source.is_healthy(),
            source.frames_captured,
            source.capture_errors,
            source.source,
            self.stats.cycles,
            self.stats.failures,
            gate,
            self.publisher.last_sequence()
        );
    }

    /// Move the loop onto its own thread.
    pub fn spawn(mut self) -> Result<LoopHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("frame-loop".to_string())
            .spawn(move || self.run(&shutdown_thread))
            .context("spawn frame loop thread")?;
        Ok(LoopHandle {
            shutdown,
            join: Some(join),
        })
    }
}

#[derive(Debug)]
pub struct LoopHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl LoopHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("frame loop thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::StubActuator;
    use crate::config::GateSettings;
    use crate::frame::Frame;
    use crate::gate::{GateCommand, GateState};
    use crate::ingest::SourceStats;
    use crate::reporter::{EventReporter, GateEvent};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of capture outcomes; `None` is a capture error.
    struct ScriptedSource {
        script: VecDeque<Option<u8>>,
        captured: u64,
    }

    impl ScriptedSource {
        fn new(script: &[Option<u8>]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                captured: 0,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn capture_frame(&mut self) -> Result<Frame> {
            match self.script.pop_front().flatten() {
                Some(shade) => {
                    self.captured += 1;
                    Frame::from_rgb(vec![shade; 32 * 24 * 3], 32, 24, self.captured)
                }
                None => Err(anyhow!("device unplugged")),
            }
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.captured,
                capture_errors: 0,
                source: "scripted".to_string(),
            }
        }
    }

    /// Reports a helmet at the given confidence when the frame is bright.
    struct BrightnessDetector {
        confidence: f32,
        fail: bool,
    }

    impl Detector for BrightnessDetector {
        fn name(&self) -> &'static str {
            "brightness"
        }

        fn input_size(&self) -> (u32, u32) {
            (8, 8)
        }

        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            if self.fail {
                return Err(anyhow!("inference failed"));
            }
            assert_eq!((frame.width(), frame.height()), (8, 8));
            if frame.pixels()[0] > 127 {
                Ok(vec![Detection::new("helmet", self.confidence)])
            } else {
                Ok(vec![Detection::new("person", 0.9)])
            }
        }
    }

    #[derive(Default)]
    struct CountingReporter(Mutex<u32>);

    impl EventReporter for CountingReporter {
        fn report(&self, _event: GateEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    struct Harness {
        frame_loop: FrameLoop,
        gate: Arc<GateController>,
        publisher: Arc<FramePublisher>,
        flags: Arc<RuntimeFlags>,
        actuator: StubActuator,
        reporter: Arc<CountingReporter>,
    }

    fn harness(script: &[Option<u8>], detector: BrightnessDetector) -> Harness {
        let actuator = StubActuator::new();
        let reporter = Arc::new(CountingReporter::default());
        let gate = Arc::new(GateController::new(
            Box::new(actuator.clone()),
            reporter.clone(),
            GateSettings {
                open_angle: 90,
                closed_angle: 0,
                dwell: Duration::ZERO,
            },
        ));
        let publisher = Arc::new(FramePublisher::new());
        let flags = Arc::new(RuntimeFlags::new());
        let frame_loop = FrameLoop::new(
            Box::new(ScriptedSource::new(script)),
            Box::new(detector),
            gate.clone(),
            publisher.clone(),
            flags.clone(),
            PipelineSettings {
                cycle_sleep: Duration::from_millis(1),
                error_backoff: Duration::from_millis(5),
                jpeg_quality: 70,
            },
            0.35,
        );
        Harness {
            frame_loop,
            gate,
            publisher,
            flags,
            actuator,
            reporter,
        }
    }

    fn detector(confidence: f32) -> BrightnessDetector {
        BrightnessDetector {
            confidence,
            fail: false,
        }
    }

    #[test]
    fn cycles_drive_gate_and_publish_frames() -> Result<()> {
        let mut h = harness(&[Some(0), Some(255), Some(255), Some(0)], detector(0.9));

        let reports = (0..4)
            .map(|_| h.frame_loop.run_cycle())
            .collect::<Result<Vec<_>>>()?;

        let helmets: Vec<bool> = reports.iter().map(|r| r.helmet_present).collect();
        assert_eq!(helmets, vec![false, true, true, false]);
        assert_eq!(reports[1].transition, Some(Transition::Opened));
        assert_eq!(reports[3].transition, Some(Transition::Closed));
        assert_eq!(reports[3].published_sequence, 4);

        assert_eq!(h.actuator.commands(), vec![90, 0]);
        assert_eq!(*h.reporter.0.lock().unwrap(), 1);
        assert!(h.flags.camera_online());
        assert!(h.flags.model_loaded());

        let latest = h.publisher.latest()?.expect("published");
        assert_eq!(&latest.jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn low_confidence_detections_are_ignored() -> Result<()> {
        let mut h = harness(&[Some(255)], detector(0.2));
        let report = h.frame_loop.run_cycle()?;
        assert!(!report.helmet_present);
        assert_eq!(report.transition, None);
        assert_eq!(h.gate.status()?.state, GateState::Closed);
        Ok(())
    }

    #[test]
    fn manual_override_suppresses_automatic_close() -> Result<()> {
        let mut h = harness(&[Some(0), Some(0)], detector(0.9));
        h.gate.apply_manual_command(GateCommand::Open)?;
        h.frame_loop.run_cycle()?;
        h.frame_loop.run_cycle()?;
        assert_eq!(h.gate.status()?.state, GateState::Open);
        assert_eq!(h.actuator.commands(), vec![90]);
        Ok(())
    }

    #[test]
    fn capture_failure_marks_camera_offline_and_recovers() -> Result<()> {
        let mut h = harness(&[None, Some(0)], detector(0.9));
        assert!(h.frame_loop.run_cycle().is_err());
        assert!(!h.flags.camera_online());
        assert!(h.publisher.latest().unwrap().is_none());

        h.frame_loop.run_cycle()?;
        assert!(h.flags.camera_online());
        assert_eq!(h.publisher.last_sequence(), 1);
        Ok(())
    }

    #[test]
    fn detector_failure_fails_the_cycle() {
        let mut h = harness(
            &[Some(255)],
            BrightnessDetector {
                confidence: 0.9,
                fail: true,
            },
        );
        let err = h.frame_loop.run_cycle().unwrap_err();
        assert!(format!("{:#}", err).contains("inference failed"));
        assert!(h.publisher.latest().unwrap().is_none());
        assert!(h.actuator.commands().is_empty());
    }

    #[test]
    fn spawned_loop_survives_failures_and_stops() -> Result<()> {
        let script: Vec<Option<u8>> = (0..200)
            .map(|i| if i % 3 == 0 { None } else { Some(0) })
            .collect();
        let h = harness(&script, detector(0.9));
        let publisher = h.publisher.clone();
        let handle = h.frame_loop.spawn()?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.last_sequence() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop()?;
        assert!(publisher.last_sequence() >= 3);
        Ok(())
    }
}
