//! Detection loop lifecycle: `Idle -> Running -> Stopping -> Idle`.
//!
//! [`DetectionController::start`] only flips the state and spawns the loop
//! thread; opening the camera and the session happens on that thread. Every
//! failure there is reported through the alert ledger and ends in `Idle`.
//! [`DetectionController::stop`] is cooperative: the loop checks the state
//! between frames.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use actix_web::web::Bytes;
use chrono::Local;
use ml_core::ObjectDetector;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CaptureError, Frame};

use crate::surveillance::{
    alerts::{AlertCategory, AlertLedger, ExportOutcome},
    annotation,
    detection::{self, AnalysisContext, PipelineError},
    geolocation::GeolocationGuard,
    preview::{FramePacket, PreviewBuffer},
    recorder::{Session, SessionRecorder},
    sound::Alerter,
    source::{FrameSource, SourceFactory},
    telemetry,
};

pub(crate) const CAMERA_FAILED_MESSAGE: &str = "Camera failed to open";
pub(crate) const FRAME_READ_FAILED_MESSAGE: &str = "Frame read failed";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopState {
    Idle,
    /// Set as soon as the loop thread is spawned, before the source and the
    /// session are opened; a failure there reports an alert and returns to
    /// `Idle`.
    Running,
    Stopping,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StartOutcome {
    Started,
    AlreadyRunning,
    /// The loop thread could not be spawned.
    Failed(String),
}

impl StartOutcome {
    pub(crate) fn status_text(&self) -> String {
        match self {
            StartOutcome::Started => "Camera started".into(),
            StartOutcome::AlreadyRunning => "Camera already running".into(),
            StartOutcome::Failed(reason) => format!("Camera failed to start: {reason}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StopOutcome {
    Stopping,
    NotRunning,
}

impl StopOutcome {
    pub(crate) fn status_text(&self) -> &'static str {
        match self {
            StopOutcome::Stopping => "Camera stopping",
            StopOutcome::NotRunning => "Camera not running",
        }
    }
}

/// Everything the loop reads from or writes to.
pub(crate) struct Collaborators {
    pub(crate) ledger: Arc<AlertLedger>,
    pub(crate) recorder: Arc<SessionRecorder>,
    pub(crate) preview: Arc<PreviewBuffer>,
    pub(crate) sources: Arc<dyn SourceFactory>,
    pub(crate) detector: Arc<Mutex<Box<dyn ObjectDetector>>>,
    pub(crate) geolocation: Arc<GeolocationGuard>,
    pub(crate) alerter: Arc<dyn Alerter>,
}

#[derive(Clone, Debug)]
pub(crate) struct LoopSettings {
    pub(crate) fps: f64,
    pub(crate) jpeg_quality: u8,
    pub(crate) frame_pause: Duration,
    pub(crate) verbose: bool,
}

struct ControlState {
    state: LoopState,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    collaborators: Collaborators,
    settings: LoopSettings,
    control: Mutex<ControlState>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.lock().state == LoopState::Running
    }

    fn finish(&self) {
        self.lock().state = LoopState::Idle;
        metrics::gauge!("surveillance_loop_running").set(0.0);
        self.idle.notify_all();
    }
}

pub(crate) struct DetectionController {
    shared: Arc<Shared>,
}

impl DetectionController {
    pub(crate) fn new(collaborators: Collaborators, settings: LoopSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                collaborators,
                settings,
                control: Mutex::new(ControlState {
                    state: LoopState::Idle,
                    worker: None,
                }),
                idle: Condvar::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> LoopState {
        self.shared.lock().state
    }

    /// Spawn the loop if idle. Never blocks on the camera.
    pub(crate) fn start(&self) -> StartOutcome {
        let mut control = self.shared.lock();
        if control.state != LoopState::Idle {
            return StartOutcome::AlreadyRunning;
        }
        if let Some(previous) = control.worker.take() {
            // Already past `finish`, so this returns promptly.
            let _ = previous.join();
        }

        control.state = LoopState::Running;
        let shared = self.shared.clone();
        match telemetry::spawn_thread("detection-loop", move || drive(&shared)) {
            Ok(handle) => {
                control.worker = Some(handle);
                metrics::gauge!("surveillance_loop_running").set(1.0);
                info!("Detection loop started");
                StartOutcome::Started
            }
            Err(err) => {
                control.state = LoopState::Idle;
                error!("Failed to spawn detection loop: {err}");
                StartOutcome::Failed(err.to_string())
            }
        }
    }

    /// Ask a running loop to stop after the current frame.
    pub(crate) fn stop(&self) -> StopOutcome {
        let mut control = self.shared.lock();
        match control.state {
            LoopState::Idle => StopOutcome::NotRunning,
            LoopState::Running => {
                control.state = LoopState::Stopping;
                info!("Detection loop stopping");
                StopOutcome::Stopping
            }
            LoopState::Stopping => StopOutcome::Stopping,
        }
    }

    /// Block until the loop is idle and its thread has exited.
    pub(crate) fn wait(&self) {
        let worker = {
            let mut control = self.shared.lock();
            while control.state != LoopState::Idle {
                control = self
                    .shared
                    .idle
                    .wait(control)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            control.worker.take()
        };
        if let Some(handle) = worker {
            let _ = handle.join();
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Returns whether
    /// the loop reached `Idle`.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let control = self.shared.lock();
        let (control, _) = self
            .shared
            .idle
            .wait_timeout_while(control, timeout, |c| c.state != LoopState::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        control.state == LoopState::Idle
    }
}

fn drive(shared: &Shared) {
    let c = &shared.collaborators;
    let span = info_span!("surveillance.loop", source = %c.sources.describe());
    let _span_guard = span.enter();

    let mut source = match c.sources.open() {
        Ok(source) => source,
        Err(err) => {
            warn!("Camera unavailable: {err}");
            c.ledger.record(CAMERA_FAILED_MESSAGE, AlertCategory::Info);
            shared.finish();
            return;
        }
    };

    let (width, height) = source.dimensions();
    let session = match c.recorder.begin_session(width, height, shared.settings.fps) {
        Ok(session) => session,
        Err(err) => {
            error!("Recording failed to start: {err}");
            c.ledger
                .record(format!("Recording failed to start: {err}"), AlertCategory::Info);
            drop(source);
            shared.finish();
            return;
        }
    };
    c.preview.clear();

    run_frames(shared, source.as_mut());
    drop(source);

    teardown(c, &session);
    shared.finish();
    info!("Detection loop idle");
}

fn run_frames(shared: &Shared, source: &mut dyn FrameSource) {
    let c = &shared.collaborators;
    let mut frame_number: u64 = 0;

    while shared.is_running() {
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(CaptureError::Closed) => {
                info!("Frame source reached end of stream after {frame_number} frame(s)");
                c.ledger.record(FRAME_READ_FAILED_MESSAGE, AlertCategory::Info);
                break;
            }
            Err(err) => {
                warn!("Frame read failed: {err}");
                c.ledger.record(FRAME_READ_FAILED_MESSAGE, AlertCategory::Info);
                break;
            }
        };
        frame_number += 1;

        if let Err(err) = process_frame(shared, frame, frame_number) {
            error!("Detection loop aborted on frame {frame_number}: {err}");
            c.ledger
                .record(format!("Detection stopped: {err}"), AlertCategory::Info);
            break;
        }

        if !shared.settings.frame_pause.is_zero() {
            thread::sleep(shared.settings.frame_pause);
        }
    }
}

fn process_frame(shared: &Shared, frame: Frame, frame_number: u64) -> Result<(), PipelineError> {
    let c = &shared.collaborators;
    let _frame_span = tracing::debug_span!("frame", number = frame_number).entered();
    let started = Instant::now();

    let raw = annotation::frame_to_rgb(&frame).map_err(PipelineError::Frame)?;
    let analyzed = {
        let mut detector = c.detector.lock().unwrap_or_else(PoisonError::into_inner);
        let ctx = AnalysisContext {
            ledger: &c.ledger,
            geolocation: &c.geolocation,
            alerter: c.alerter.as_ref(),
            verbose: shared.settings.verbose,
        };
        detection::analyze_frame(&ctx, detector.as_mut(), raw)?
    };
    if analyzed.alerts > 0 {
        debug!("frame {frame_number} raised {} alert(s)", analyzed.alerts);
    }

    match annotation::encode_jpeg(&analyzed.image, shared.settings.jpeg_quality) {
        Ok(jpeg) => {
            c.preview.publish(FramePacket {
                jpeg: Bytes::from(jpeg),
                frame_number,
                timestamp_ms: frame.timestamp_ms,
            });
        }
        Err(err) => warn!("Preview encode failed: {err}"),
    }

    c.recorder.write_frame(&analyzed.image)?;

    metrics::counter!("surveillance_frames_total").increment(1);
    metrics::histogram!("surveillance_frame_seconds").record(started.elapsed().as_secs_f64());
    Ok(())
}

/// Close the session and write the ledger next to its video.
fn teardown(c: &Collaborators, session: &Session) {
    if let Err(err) = c.recorder.end_session() {
        error!("Failed to close session {}: {err}", session.folder.display());
    }

    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let destination = session.folder.join(format!("alerts_{stamp}.csv"));
    match c.ledger.export_csv(&destination) {
        Ok(ExportOutcome::Written { rows }) => {
            debug!("Exported {rows} alert(s) to {}", destination.display());
        }
        Ok(ExportOutcome::NothingToExport) => debug!("No alerts to export"),
        Err(err) => error!("Failed to export alerts: {err}"),
    }
}
