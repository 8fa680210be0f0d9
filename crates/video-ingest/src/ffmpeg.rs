use std::{
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
    sync::{Arc, Mutex},
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Sender, bounded};
use image::RgbImage;
use tracing::{debug, warn};

use crate::types::{
    CaptureError, CaptureStream, Frame, FrameFormat, SharedChild, SinkError, VideoSink, reap_child,
};

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

/// Spawn an FFmpeg process decoding `uri` into BGR8 frames of `target_size`.
///
/// Camera indices and `/dev/videoN` paths are opened through video4linux2,
/// `rtsp://` sources over TCP, and anything else as a file played back at its
/// native rate. Frames arrive over a small bounded channel so a slow consumer
/// backpressures the decoder. End of stream surfaces as
/// [`CaptureError::Closed`].
pub fn spawn_ffmpeg_capture(uri: &str, target_size: (i32, i32)) -> Result<CaptureStream, CaptureError> {
    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    if let Some(index) = parse_device_index(uri) {
        cmd.arg("-f")
            .arg("video4linux2")
            .arg("-i")
            .arg(format!("/dev/video{index}"));
    } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        cmd.arg("-rtsp_transport")
            .arg("tcp")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay")
            .arg("-i")
            .arg(uri);
    } else {
        cmd.arg("-re").arg("-i").arg(uri);
    }

    cmd.arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");

    spawn_command_capture(cmd, uri, target_size)
}

/// Run `cmd` and read BGR24 frames of `target_size` from its stdout.
///
/// `uri` only labels errors. The returned stream owns the child process.
pub fn spawn_command_capture(
    mut cmd: Command,
    uri: &str,
    target_size: (i32, i32),
) -> Result<CaptureStream, CaptureError> {
    let (tx, rx) = bounded(2);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| {
        warn!("video-ingest: failed to spawn capture process for {uri}: {err}");
        CaptureError::Open {
            uri: uri.to_string(),
        }
    })?;
    let stdout = child.stdout.take();
    let process: SharedChild = Arc::new(Mutex::new(Some(child)));
    let Some(stdout) = stdout else {
        reap_child(&process);
        return Err(CaptureError::Other(anyhow!("failed to capture decoder stdout")));
    };

    let reader_process = process.clone();
    let spawned = thread::Builder::new()
        .name("ffmpeg-capture".into())
        .spawn(move || {
            if let Err(err) = ffmpeg_loop(stdout, &reader_process, target_size, tx.clone()) {
                let _ = tx.send(Err(err));
            }
        });
    if let Err(err) = spawned {
        reap_child(&process);
        return Err(CaptureError::Other(err.into()));
    }

    Ok(CaptureStream::with_process(rx, process))
}

fn ffmpeg_loop(
    mut stdout: impl Read,
    process: &Mutex<Option<Child>>,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];
    let mut result = Ok(());

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let timestamp_ms = Utc::now().timestamp_millis();
                if tx
                    .send(Ok(Frame {
                        data: buffer.clone(),
                        width: target_size.0,
                        height: target_size.1,
                        timestamp_ms,
                        format: FrameFormat::Bgr8,
                    }))
                    .is_err()
                {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                result = Err(CaptureError::Closed);
                break;
            }
            Err(err) => {
                result = Err(CaptureError::Other(err.into()));
                break;
            }
        }
    }

    reap_child(process);
    result
}

/// MP4 writer that pipes raw RGB frames into an FFmpeg `mpeg4` encoder.
pub struct FfmpegVideoWriter {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    path: PathBuf,
}

impl FfmpegVideoWriter {
    pub fn create(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self, SinkError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(SinkError::UnsupportedResolution { width, height });
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-r")
            .arg(format!("{fps}"))
            .arg("-i")
            .arg("-")
            .arg("-an")
            .arg("-c:v")
            .arg("mpeg4")
            .arg("-q:v")
            .arg("5")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|err| SinkError::Open {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| SinkError::Open {
            path: path.to_path_buf(),
            reason: "ffmpeg stdin unavailable".into(),
        })?;

        debug!("video-ingest: recording {width}x{height}@{fps} to {}", path.display());
        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            width,
            height,
            path: path.to_path_buf(),
        })
    }

    fn close(&mut self) -> Result<(), SinkError> {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|err| SinkError::Finish(err.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(SinkError::Finish(format!(
                "ffmpeg exited with {status} while writing {}",
                self.path.display()
            )))
        }
    }
}

impl VideoSink for FfmpegVideoWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(SinkError::SizeMismatch {
                width: self.width,
                height: self.height,
                got_width: frame.width(),
                got_height: frame.height(),
            });
        }
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            SinkError::Write(std::io::Error::new(ErrorKind::BrokenPipe, "sink closed"))
        })?;
        stdin.write_all(frame.as_raw()).map_err(SinkError::Write)
    }

    fn finish(mut self: Box<Self>) -> Result<(), SinkError> {
        self.close()
    }
}

impl Drop for FfmpegVideoWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("video-ingest: {err}");
        }
    }
}
