//! Service supervisor wiring the ledger, recorder, detection loop, and control
//! surface together, then parking until Ctrl+C.

use std::{
    fs,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use actix_web::web;
use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use ml_core::{NoopDetector, ObjectDetector};
use tracing::{info, warn};

use crate::surveillance::{
    SurveillanceConfig,
    alerts::{AlertCategory, AlertLedger},
    config::GeolocationSettings,
    controller::{Collaborators, DetectionController, LoopSettings, StopOutcome},
    geolocation::{DisabledGeolocator, GeolocationGuard, Geolocator, IpGeolocator},
    preview::PreviewBuffer,
    recorder::{BackendSinkFactory, SessionRecorder},
    server::{ServerState, spawn_control_server},
    sound::{Alerter, SilentAlerter, SoundAlerter},
    source::CaptureSourceFactory,
    telemetry,
};

pub(crate) const STARTUP_MESSAGE: &str = "Smart Surveillance started";

/// How long shutdown waits for the loop before logging that it is slow.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// YOLOv8 TorchScript exports take square 640px input.
#[cfg(feature = "with-tch")]
const DETECTOR_INPUT: (u32, u32) = (640, 640);

/// Run the service until Ctrl+C, then stop the loop and the server in order.
pub fn run(config: SurveillanceConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    if let Err(err) = telemetry::init_metrics_recorder() {
        warn!("Prometheus metrics unavailable: {err}");
    }
    let service_span = tracing::info_span!(
        "surveillance",
        source = %config.source,
        width = config.width,
        height = config.height,
        fps = config.fps,
        backend = ?config.backend,
        use_cpu = config.use_cpu,
        bind = %config.bind,
    );
    let _service_span_guard = service_span.enter();

    fs::create_dir_all(&config.sessions_dir).with_context(|| {
        format!(
            "Failed to create sessions directory {}",
            config.sessions_dir.display()
        )
    })?;

    let ledger = Arc::new(AlertLedger::new());
    ledger.record(STARTUP_MESSAGE, AlertCategory::Info);

    let detector = build_detector(&config)?;
    info!("Primary detector: {}", detector.name());
    let geolocation = Arc::new(build_geolocation(&config.geolocation)?);
    let alerter: Arc<dyn Alerter> = match config.sound.as_ref() {
        Some(sound) => Arc::new(SoundAlerter::new(
            config.sound_player.clone(),
            sound.clone(),
            config.sound_cooldown,
        )),
        None => Arc::new(SilentAlerter),
    };

    let recorder = Arc::new(SessionRecorder::new(
        config.sessions_dir.clone(),
        Box::new(BackendSinkFactory::new(config.backend)),
    ));
    let preview = Arc::new(PreviewBuffer::new());
    let sources = Arc::new(CaptureSourceFactory::new(
        config.source.clone(),
        (config.width as i32, config.height as i32),
        config.backend,
        config.first_frame_timeout,
    ));

    let controller = Arc::new(DetectionController::new(
        Collaborators {
            ledger: ledger.clone(),
            recorder: recorder.clone(),
            preview: preview.clone(),
            sources,
            detector: Arc::new(Mutex::new(detector)),
            geolocation,
            alerter,
        },
        LoopSettings {
            fps: config.fps,
            jpeg_quality: config.jpeg_quality,
            frame_pause: config.frame_pause,
            verbose: config.verbose,
        },
    ));

    let shutdown = shutdown_signal()?;
    let server = spawn_control_server(
        config.bind,
        web::Data::new(ServerState {
            controller: controller.clone(),
            ledger,
            recorder,
            preview,
        }),
    )?;

    let _ = shutdown.recv();
    info!("Shutdown requested, detection loop is {:?}", controller.state());
    if controller.stop() == StopOutcome::Stopping && !controller.wait_timeout(SHUTDOWN_GRACE) {
        warn!("Detection loop still finishing its frame after {SHUTDOWN_GRACE:?}");
    }
    controller.wait();
    server.stop();
    info!("Surveillance service stopped");
    Ok(())
}

/// Ctrl+C notifications. The handler is installed once per process and its
/// sender lives in the handler, so the receiver never disconnects.
fn shutdown_signal() -> Result<&'static Receiver<()>> {
    static SIGNAL: OnceLock<Receiver<()>> = OnceLock::new();
    if let Some(rx) = SIGNAL.get() {
        return Ok(rx);
    }
    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("Failed to install Ctrl+C handler")?;
    Ok(SIGNAL.get_or_init(|| rx))
}

fn build_detector(config: &SurveillanceConfig) -> Result<Box<dyn ObjectDetector>> {
    match config.model_path.as_ref() {
        None => {
            info!("No model configured; only the colour heuristic will raise alerts");
            Ok(Box::new(NoopDetector))
        }
        #[cfg(feature = "with-tch")]
        Some(path) => {
            use ml_core::{tch::Device, torch::YoloDetector};

            let device = if config.use_cpu {
                Device::Cpu
            } else {
                Device::cuda_if_available()
            };
            let detector = YoloDetector::load(path, device, DETECTOR_INPUT)
                .with_context(|| format!("Failed to load TorchScript model {}", path.display()))?;
            info!("Loaded {} on {:?}", path.display(), detector.device());
            Ok(Box::new(detector))
        }
        #[cfg(not(feature = "with-tch"))]
        Some(path) => anyhow::bail!(
            "Cannot load {}: built without the `with-tch` feature",
            path.display()
        ),
    }
}

fn build_geolocation(settings: &GeolocationSettings) -> Result<GeolocationGuard> {
    let inner: Box<dyn Geolocator> = match settings.url.as_ref() {
        Some(url) => Box::new(
            IpGeolocator::new(url.clone(), settings.timeout)
                .context("Failed to build geolocation client")?,
        ),
        None => {
            info!("Geolocation disabled");
            Box::new(DisabledGeolocator)
        }
    };
    Ok(GeolocationGuard::new(
        inner,
        settings.cache_ttl,
        settings.failure_cooldown,
    ))
}
