//! Capture and recording backends.
//!
//! Capture runs on a background thread per source and hands frames over a
//! bounded channel. Recording goes through [`VideoSink`], implemented by an
//! FFmpeg pipe writer and, with the `with-opencv` feature, an OpenCV writer.

#[cfg(feature = "with-opencv")]
pub mod camera;
pub mod ffmpeg;
pub mod types;

#[cfg(feature = "with-opencv")]
pub use camera::{OpenCvVideoWriter, spawn_camera_reader};
pub use ffmpeg::{FfmpegVideoWriter, spawn_command_capture, spawn_ffmpeg_capture};
pub use types::{CaptureError, CaptureStream, Frame, FrameFormat, FrameReceiver, SinkError, VideoSink};
