use std::{
    path::PathBuf,
    process::Child,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Error;
use crossbeam_channel::Receiver;
use image::RgbImage;
use thiserror::Error;

/// Raw BGR frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Number of bytes a well-formed BGR8 frame of this size occupies.
    pub fn expected_len(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * 3
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

/// Stream of frames produced by a capture thread.
pub type FrameReceiver = Receiver<Result<Frame, CaptureError>>;

/// Decoder process shared between a capture thread and its [`CaptureStream`].
/// Whoever takes the child out first kills and reaps it.
pub(crate) type SharedChild = Arc<Mutex<Option<Child>>>;

/// Frames from a capture thread together with ownership of the process that
/// produces them.
///
/// Dropping the stream kills that process, which also unblocks a capture
/// thread stuck waiting on a silent source.
pub struct CaptureStream {
    frames: FrameReceiver,
    process: Option<SharedChild>,
}

impl CaptureStream {
    /// Wrap a channel whose producer stops on its own once the receiver is gone.
    pub fn from_receiver(frames: FrameReceiver) -> Self {
        Self {
            frames,
            process: None,
        }
    }

    pub(crate) fn with_process(frames: FrameReceiver, process: SharedChild) -> Self {
        Self {
            frames,
            process: Some(process),
        }
    }

    pub fn frames(&self) -> &FrameReceiver {
        &self.frames
    }

    /// OS id of the decoder process while it is still owned by this stream.
    pub fn process_id(&self) -> Option<u32> {
        let process = self.process.as_ref()?;
        let guard = process.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(Child::id)
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            reap_child(&process);
        }
    }
}

pub(crate) fn reap_child(process: &Mutex<Option<Child>>) {
    let child = process.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(mut child) = child {
        let _ = child.kill();
        let _ = child.wait();
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source reached end of stream")]
    Closed,
    #[error(transparent)]
    Other(#[from] Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("unsupported recording size {width}x{height} (both sides must be positive and even)")]
    UnsupportedResolution { width: u32, height: u32 },
    #[error("failed to open video sink at {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("frame is {got_width}x{got_height} but sink expects {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
    #[error("failed to write frame: {0}")]
    Write(#[source] std::io::Error),
    #[error("encoder did not finish cleanly: {0}")]
    Finish(String),
}

/// Sequential, write-once video output.
pub trait VideoSink: Send {
    /// Append one frame. Frames must match the size the sink was opened with.
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError>;

    /// Flush and close the underlying file.
    fn finish(self: Box<Self>) -> Result<(), SinkError>;
}
