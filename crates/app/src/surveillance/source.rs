//! Frame source plumbing between capture threads and the detection loop.

use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::RecvTimeoutError;
use tracing::debug;
use video_ingest::{CaptureError, CaptureStream, Frame};

use crate::surveillance::config::VideoBackend;

/// Sequential producer of frames. Dropping it releases the device.
pub(crate) trait FrameSource: Send {
    /// Block until the next frame or report end of stream / failure.
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Size of the frames this source produces.
    fn dimensions(&self) -> (u32, u32);
}

/// Opens a fresh [`FrameSource`] for each detection run.
pub(crate) trait SourceFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError>;

    fn describe(&self) -> String;
}

/// Adapts a capture thread's channel into a [`FrameSource`].
///
/// Opening waits for the first frame so a device that never delivers anything
/// is reported as unopenable rather than as an immediate read failure. Later
/// reads give up after the same timeout, so a stalled stream surfaces as a read
/// failure instead of pinning the loop. Dropping the source, including on a
/// failed open, kills the capture process.
pub(crate) struct ChannelFrameSource {
    stream: CaptureStream,
    pending: Option<Frame>,
    dimensions: (u32, u32),
    read_timeout: Duration,
}

impl ChannelFrameSource {
    pub(crate) fn open(uri: &str, stream: CaptureStream, read_timeout: Duration) -> Result<Self, CaptureError> {
        let open_failed = || CaptureError::Open {
            uri: uri.to_string(),
        };
        let first = match stream.frames().recv_timeout(read_timeout) {
            Ok(Ok(frame)) => frame,
            Ok(Err(CaptureError::Closed)) => return Err(open_failed()),
            Ok(Err(err)) => return Err(err),
            Err(RecvTimeoutError::Timeout) => {
                debug!("no frame from {uri} within {read_timeout:?}");
                return Err(open_failed());
            }
            Err(RecvTimeoutError::Disconnected) => return Err(open_failed()),
        };
        let dimensions = (first.width.max(0) as u32, first.height.max(0) as u32);
        Ok(Self {
            stream,
            pending: Some(first),
            dimensions,
            read_timeout,
        })
    }
}

impl FrameSource for ChannelFrameSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        match self.stream.frames().recv_timeout(self.read_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Other(anyhow!(
                "no frame within {:?}",
                self.read_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }
}

/// Opens the configured camera URI through the selected capture backend.
pub(crate) struct CaptureSourceFactory {
    uri: String,
    size: (i32, i32),
    backend: VideoBackend,
    first_frame_timeout: Duration,
}

impl CaptureSourceFactory {
    pub(crate) fn new(uri: impl Into<String>, size: (i32, i32), backend: VideoBackend, first_frame_timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            size,
            backend,
            first_frame_timeout,
        }
    }
}

impl SourceFactory for CaptureSourceFactory {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        let stream = match self.backend {
            VideoBackend::Ffmpeg => video_ingest::spawn_ffmpeg_capture(&self.uri, self.size)?,
            #[cfg(feature = "with-opencv")]
            VideoBackend::Opencv => video_ingest::spawn_camera_reader(&self.uri, self.size)?,
        };
        let source = ChannelFrameSource::open(&self.uri, stream, self.first_frame_timeout)?;
        Ok(Box::new(source))
    }

    fn describe(&self) -> String {
        format!("{} ({:?}, {}x{})", self.uri, self.backend, self.size.0, self.size.1)
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, process::Command};

    use crossbeam_channel::bounded;

    use super::*;
    use crate::surveillance::testing::bgr_frame;

    #[test]
    fn yields_peeked_frame_then_remaining_then_closed() {
        let (tx, rx) = bounded(4);
        tx.send(Ok(bgr_frame(6, 4, [0, 0, 0]))).unwrap();
        tx.send(Ok(bgr_frame(6, 4, [1, 1, 1]))).unwrap();
        drop(tx);

        let mut source = ChannelFrameSource::open("test", CaptureStream::from_receiver(rx), Duration::from_millis(100)).unwrap();
        assert_eq!(source.dimensions(), (6, 4));
        assert_eq!(source.next_frame().unwrap().data[0], 0);
        assert_eq!(source.next_frame().unwrap().data[0], 1);
        assert!(matches!(source.next_frame(), Err(CaptureError::Closed)));
    }

    #[test]
    fn silent_source_fails_to_open() {
        let (_tx, rx) = bounded::<Result<Frame, CaptureError>>(1);
        let result = ChannelFrameSource::open("cam", CaptureStream::from_receiver(rx), Duration::from_millis(20));
        assert!(matches!(result, Err(CaptureError::Open { uri }) if uri == "cam"));
    }

    #[test]
    fn immediately_closed_source_fails_to_open() {
        let (tx, rx) = bounded(1);
        tx.send(Err(CaptureError::Closed)).unwrap();
        let result = ChannelFrameSource::open("clip.mp4", CaptureStream::from_receiver(rx), Duration::from_millis(20));
        assert!(matches!(result, Err(CaptureError::Open { .. })));
    }

    #[test]
    fn stalled_stream_fails_the_read_instead_of_blocking() {
        let (tx, rx) = bounded(1);
        tx.send(Ok(bgr_frame(2, 2, [0, 0, 0]))).unwrap();
        let mut source =
            ChannelFrameSource::open("cam", CaptureStream::from_receiver(rx), Duration::from_millis(30)).unwrap();
        source.next_frame().unwrap();
        assert!(matches!(source.next_frame(), Err(CaptureError::Other(_))));
        drop(tx);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_open_kills_the_capture_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let stream = video_ingest::spawn_command_capture(cmd, "rtsp://hung/stream", (64, 48)).unwrap();
        let pid = stream.process_id().unwrap();

        let result = ChannelFrameSource::open("rtsp://hung/stream", stream, Duration::from_millis(200));
        assert!(matches!(result, Err(CaptureError::Open { .. })));
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }
}
