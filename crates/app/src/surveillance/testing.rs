//! In-memory collaborators for unit tests.

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use image::{Rgb, RgbImage};
use ml_core::{Detection, DetectorError, DetectorOutput, ObjectDetector};
use video_ingest::{CaptureError, Frame, FrameFormat, SinkError, VideoSink};

use crate::surveillance::{
    geolocation::{Coordinates, GeoError, Geolocator},
    recorder::SinkFactory,
    sound::Alerter,
    source::{FrameSource, SourceFactory},
};

pub(crate) fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(rgb))
}

/// BGR frame filled with `bgr`.
pub(crate) fn bgr_frame(width: u32, height: u32, bgr: [u8; 3]) -> Frame {
    let data = bgr
        .iter()
        .copied()
        .cycle()
        .take(width as usize * height as usize * 3)
        .collect();
    Frame {
        data,
        width: width as i32,
        height: height as i32,
        timestamp_ms: 0,
        format: FrameFormat::Bgr8,
    }
}

#[derive(Default)]
pub(crate) struct SinkLog {
    pub(crate) opened: AtomicUsize,
    pub(crate) frames: AtomicUsize,
    pub(crate) finished: AtomicUsize,
    pub(crate) last_size: Mutex<Option<(u32, u32)>>,
}

#[derive(Default)]
pub(crate) struct MemorySinkFactory {
    log: Arc<SinkLog>,
}

impl MemorySinkFactory {
    pub(crate) fn log(&self) -> Arc<SinkLog> {
        self.log.clone()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, _path: &Path, width: u32, height: u32, _fps: f64) -> Result<Box<dyn VideoSink>, SinkError> {
        self.log.opened.fetch_add(1, Ordering::SeqCst);
        *self.log.last_size.lock().unwrap() = Some((width, height));
        Ok(Box::new(MemorySink {
            log: self.log.clone(),
        }))
    }
}

struct MemorySink {
    log: Arc<SinkLog>,
}

impl VideoSink for MemorySink {
    fn write_frame(&mut self, _frame: &RgbImage) -> Result<(), SinkError> {
        self.log.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), SinkError> {
        self.log.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Every open is rejected as an unsupported codec.
pub(crate) struct FailingSinkFactory;

impl SinkFactory for FailingSinkFactory {
    fn open(&self, path: &Path, _width: u32, _height: u32, _fps: f64) -> Result<Box<dyn VideoSink>, SinkError> {
        Err(SinkError::Open {
            path: path.to_path_buf(),
            reason: "codec unavailable".into(),
        })
    }
}

/// Replays one script of frames per open, then reports end of stream. Once
/// the scripts run out the last one repeats.
pub(crate) struct ScriptedSourceFactory {
    runs: Vec<Vec<Frame>>,
    dimensions: (u32, u32),
    opens: Arc<AtomicUsize>,
}

impl ScriptedSourceFactory {
    pub(crate) fn new(frames: Vec<Frame>) -> Self {
        Self::per_run(vec![frames])
    }

    pub(crate) fn per_run(runs: Vec<Vec<Frame>>) -> Self {
        let dimensions = runs
            .iter()
            .flatten()
            .next()
            .map(|f| (f.width as u32, f.height as u32))
            .unwrap_or((0, 0));
        Self {
            runs,
            dimensions,
            opens: Arc::default(),
        }
    }

    pub(crate) fn opens(&self) -> Arc<AtomicUsize> {
        self.opens.clone()
    }
}

impl SourceFactory for ScriptedSourceFactory {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        let run = self.opens.fetch_add(1, Ordering::SeqCst);
        let frames = self
            .runs
            .get(run)
            .or_else(|| self.runs.last())
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(ScriptedSource {
            frames: frames.into_iter(),
            dimensions: self.dimensions,
        }))
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

struct ScriptedSource {
    frames: std::vec::IntoIter<Frame>,
    dimensions: (u32, u32),
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        self.frames.next().ok_or(CaptureError::Closed)
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }
}

/// Produces black frames until dropped, pacing itself like a live camera.
pub(crate) struct EndlessSourceFactory {
    width: u32,
    height: u32,
    opens: Arc<AtomicUsize>,
}

impl EndlessSourceFactory {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            opens: Arc::default(),
        }
    }

    pub(crate) fn opens(&self) -> Arc<AtomicUsize> {
        self.opens.clone()
    }
}

impl SourceFactory for EndlessSourceFactory {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(EndlessSource {
            frame: bgr_frame(self.width, self.height, [0, 0, 0]),
        }))
    }

    fn describe(&self) -> String {
        "endless".into()
    }
}

struct EndlessSource {
    frame: Frame,
}

impl FrameSource for EndlessSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        thread::sleep(Duration::from_millis(2));
        Ok(self.frame.clone())
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.frame.width as u32, self.frame.height as u32)
    }
}

pub(crate) struct FailingSourceFactory;

impl SourceFactory for FailingSourceFactory {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        Err(CaptureError::Open {
            uri: "missing-camera".into(),
        })
    }

    fn describe(&self) -> String {
        "missing-camera".into()
    }
}

/// Returns the same detections for every frame.
pub(crate) struct ScriptedDetector {
    detections: Vec<Detection>,
    annotated: Option<RgbImage>,
    fail: bool,
}

impl ScriptedDetector {
    pub(crate) fn nothing() -> Self {
        Self::always(Vec::new())
    }

    pub(crate) fn always(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            annotated: None,
            fail: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::nothing()
        }
    }

    pub(crate) fn with_annotation(mut self, image: RgbImage) -> Self {
        self.annotated = Some(image);
        self
    }
}

impl ObjectDetector for ScriptedDetector {
    fn detect(&mut self, _frame: &RgbImage) -> Result<DetectorOutput, DetectorError> {
        if self.fail {
            return Err(DetectorError::InvalidInput("scripted failure".into()));
        }
        Ok(DetectorOutput {
            detections: self.detections.clone(),
            annotated: self.annotated.clone(),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub(crate) struct FixedGeolocator {
    result: Option<Coordinates>,
    calls: Arc<AtomicUsize>,
}

impl FixedGeolocator {
    pub(crate) fn found(coords: Coordinates) -> Self {
        Self {
            result: Some(coords),
            calls: Arc::default(),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            result: None,
            calls: Arc::default(),
        }
    }

    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Geolocator for FixedGeolocator {
    fn locate(&self) -> Result<Coordinates, GeoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
            .ok_or_else(|| GeoError::NoFix("scripted failure".into()))
    }
}

#[derive(Default)]
pub(crate) struct CountingAlerter {
    plays: Arc<AtomicUsize>,
}

impl CountingAlerter {
    pub(crate) fn plays(&self) -> Arc<AtomicUsize> {
        self.plays.clone()
    }
}

impl Alerter for CountingAlerter {
    fn play(&self) {
        self.plays.fetch_add(1, Ordering::SeqCst);
    }
}
