//! OpenCV-backed camera capture and MP4 recording.

use std::{path::Path, thread};

use chrono::Utc;
use crossbeam_channel::{Sender, bounded};
use image::RgbImage;
use opencv::{
    core::{self, MatTraitConstManual, MatTraitManual, Scalar},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoWriter},
};
use tracing::warn;

use crate::{
    ffmpeg::parse_device_index,
    types::{CaptureError, CaptureStream, Frame, FrameFormat, SinkError, VideoSink},
};

/// Spawns a background thread that continually captures frames from `uri`.
///
/// The camera is opened before this returns so an unusable device is reported
/// as [`CaptureError::Open`] instead of as an empty stream.
pub fn spawn_camera_reader(uri: &str, target_size: (i32, i32)) -> Result<CaptureStream, CaptureError> {
    let mut cap = open_video_capture(uri)?;
    configure_camera(&mut cap, target_size, 30.0);

    let (tx, rx) = bounded(2);
    thread::Builder::new()
        .name("opencv-capture".into())
        .spawn(move || {
            if let Err(err) = capture_loop(cap, target_size, tx.clone()) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(CaptureStream::from_receiver(rx))
}

fn capture_loop(
    mut cap: VideoCapture,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut frame = Mat::default();
    let mut scratch = Mat::default();
    let (target_w, target_h) = target_size;

    loop {
        let grabbed = cap
            .read(&mut frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed || size.width <= 0 {
            return Err(CaptureError::Closed);
        }

        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &frame,
                &mut scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &scratch
        } else {
            &frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        if tx
            .send(Ok(Frame {
                data,
                width: target_w,
                height: target_h,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            }))
            .is_err()
        {
            break;
        }
    }

    Ok(())
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("video-ingest: failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) => {
            if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                return Ok(cap);
            }
        }
        Err(err) => {
            warn!("video-ingest: failed to open {uri}: {err}");
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    if let Ok(mjpg) = VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}

/// MP4 writer using OpenCV's `mp4v` encoder.
pub struct OpenCvVideoWriter {
    writer: VideoWriter,
    width: u32,
    height: u32,
    scratch: Mat,
}

impl OpenCvVideoWriter {
    pub fn create(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self, SinkError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(SinkError::UnsupportedResolution { width, height });
        }
        let open_err = |reason: String| SinkError::Open {
            path: path.to_path_buf(),
            reason,
        };
        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v').map_err(|e| open_err(e.to_string()))?;
        let writer = VideoWriter::new(
            &path.to_string_lossy(),
            fourcc,
            fps,
            core::Size {
                width: width as i32,
                height: height as i32,
            },
            true,
        )
        .map_err(|e| open_err(e.to_string()))?;
        if !writer.is_opened().map_err(|e| open_err(e.to_string()))? {
            return Err(open_err("encoder refused the codec or resolution".into()));
        }
        let scratch = Mat::new_rows_cols_with_default(
            height as i32,
            width as i32,
            core::CV_8UC3,
            Scalar::all(0.0),
        )
        .map_err(|e| open_err(e.to_string()))?;
        Ok(Self {
            writer,
            width,
            height,
            scratch,
        })
    }
}

impl VideoSink for OpenCvVideoWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(SinkError::SizeMismatch {
                width: self.width,
                height: self.height,
                got_width: frame.width(),
                got_height: frame.height(),
            });
        }
        let to_io = |e: opencv::Error| SinkError::Write(std::io::Error::other(e.to_string()));
        let bytes = self.scratch.data_bytes_mut().map_err(to_io)?;
        for (dst, src) in bytes.chunks_exact_mut(3).zip(frame.as_raw().chunks_exact(3)) {
            dst[0] = src[2];
            dst[1] = src[1];
            dst[2] = src[0];
        }
        self.writer.write(&self.scratch).map_err(to_io)
    }

    fn finish(mut self: Box<Self>) -> Result<(), SinkError> {
        self.writer
            .release()
            .map_err(|e| SinkError::Finish(e.to_string()))
    }
}
