//! Session bookkeeping: one timestamped folder and one video sink per run.
//!
//! Starting a session while another is active closes the previous one first,
//! so at most one sink is ever open.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{Local, NaiveDateTime, SubsecRound};
use image::RgbImage;
use thiserror::Error;
use tracing::{info, warn};
use video_ingest::{FfmpegVideoWriter, SinkError, VideoSink};

use crate::surveillance::config::VideoBackend;

pub(crate) const VIDEO_FILE_NAME: &str = "recorded_video.mp4";
const MAX_FOLDER_SUFFIX: u32 = 1_000;

#[derive(Debug, Error)]
pub(crate) enum RecorderError {
    #[error("failed to create session directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open video sink: {0}")]
    OpenSink(#[source] SinkError),
    #[error("failed to write frame: {0}")]
    Write(#[source] SinkError),
    #[error("failed to close video sink: {0}")]
    Finish(#[source] SinkError),
    #[error("write_frame called with no active session")]
    NoActiveSession,
}

/// Opens the sink for a new session.
pub(crate) trait SinkFactory: Send + Sync {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f64) -> Result<Box<dyn VideoSink>, SinkError>;
}

/// Sink factory for the configured recording backend.
pub(crate) struct BackendSinkFactory {
    backend: VideoBackend,
}

impl BackendSinkFactory {
    pub(crate) fn new(backend: VideoBackend) -> Self {
        Self { backend }
    }
}

impl SinkFactory for BackendSinkFactory {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f64) -> Result<Box<dyn VideoSink>, SinkError> {
        match self.backend {
            VideoBackend::Ffmpeg => Ok(Box::new(FfmpegVideoWriter::create(path, width, height, fps)?)),
            #[cfg(feature = "with-opencv")]
            VideoBackend::Opencv => Ok(Box::new(video_ingest::OpenCvVideoWriter::create(
                path, width, height, fps,
            )?)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Session {
    pub(crate) folder: PathBuf,
    pub(crate) video_path: PathBuf,
    pub(crate) created_at: NaiveDateTime,
}

struct ActiveSession {
    session: Session,
    sink: Box<dyn VideoSink>,
    frames: u64,
}

#[derive(Default)]
struct RecorderState {
    active: Option<ActiveSession>,
    sessions: Vec<Session>,
}

pub(crate) struct SessionRecorder {
    root: PathBuf,
    sinks: Box<dyn SinkFactory>,
    state: Mutex<RecorderState>,
}

impl SessionRecorder {
    pub(crate) fn new(root: impl Into<PathBuf>, sinks: Box<dyn SinkFactory>) -> Self {
        Self {
            root: root.into(),
            sinks,
            state: Mutex::new(RecorderState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a fresh session folder, open its sink, and make it active.
    pub(crate) fn begin_session(&self, width: u32, height: u32, fps: f64) -> Result<Session, RecorderError> {
        let mut state = self.lock();
        if let Some(previous) = state.active.take() {
            warn!(
                "Session {} still active; closing it before starting a new one",
                previous.session.folder.display()
            );
            close_active(previous)?;
        }

        let created_at = Local::now().naive_local().trunc_subsecs(0);
        let folder = self.create_unique_folder(&created_at)?;
        let video_path = folder.join(VIDEO_FILE_NAME);
        let sink = match self.sinks.open(&video_path, width, height, fps) {
            Ok(sink) => sink,
            Err(err) => {
                let _ = fs::remove_dir_all(&folder);
                return Err(RecorderError::OpenSink(err));
            }
        };

        let session = Session {
            folder,
            video_path,
            created_at,
        };
        info!(
            "Session started in {} ({width}x{height} @ {fps} fps)",
            session.folder.display()
        );
        state.sessions.push(session.clone());
        state.active = Some(ActiveSession {
            session: session.clone(),
            sink,
            frames: 0,
        });
        Ok(session)
    }

    fn create_unique_folder(&self, created_at: &NaiveDateTime) -> Result<PathBuf, RecorderError> {
        fs::create_dir_all(&self.root).map_err(|source| RecorderError::CreateDir {
            path: self.root.clone(),
            source,
        })?;
        let stem = created_at.format("%Y%m%d_%H%M%S").to_string();
        for attempt in 0..MAX_FOLDER_SUFFIX {
            let name = if attempt == 0 {
                stem.clone()
            } else {
                format!("{stem}_{attempt}")
            };
            let candidate = self.root.join(name);
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(RecorderError::CreateDir {
                        path: candidate,
                        source,
                    });
                }
            }
        }
        Err(RecorderError::CreateDir {
            path: self.root.join(stem),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "no free session folder name"),
        })
    }

    /// Append a frame to the active session's sink.
    pub(crate) fn write_frame(&self, frame: &RgbImage) -> Result<(), RecorderError> {
        let mut state = self.lock();
        let active = state.active.as_mut().ok_or(RecorderError::NoActiveSession)?;
        active.sink.write_frame(frame).map_err(RecorderError::Write)?;
        active.frames += 1;
        Ok(())
    }

    /// Close the active sink. Returns the closed session, or `None` when no
    /// session was active.
    pub(crate) fn end_session(&self) -> Result<Option<Session>, RecorderError> {
        let Some(active) = self.lock().active.take() else {
            return Ok(None);
        };
        let session = active.session.clone();
        close_active(active)?;
        Ok(Some(session))
    }

    #[cfg(test)]
    pub(crate) fn active_session(&self) -> Option<Session> {
        self.lock().active.as_ref().map(|a| a.session.clone())
    }

    /// Most recently started session, active or not.
    pub(crate) fn latest_session(&self) -> Option<Session> {
        self.lock().sessions.last().cloned()
    }

    /// Every session started by this process, oldest first.
    pub(crate) fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.clone()
    }
}

fn close_active(active: ActiveSession) -> Result<(), RecorderError> {
    let ActiveSession {
        session,
        sink,
        frames,
    } = active;
    sink.finish().map_err(RecorderError::Finish)?;
    info!(
        "Session {} closed after {frames} frame(s)",
        session.folder.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::Ordering};

    use tempfile::tempdir;

    use super::*;
    use crate::surveillance::testing::{FailingSinkFactory, MemorySinkFactory, solid_image};

    #[test]
    fn begin_creates_folder_and_registers_session() {
        let dir = tempdir().unwrap();
        let sinks = MemorySinkFactory::default();
        let log = sinks.log();
        let recorder = SessionRecorder::new(dir.path().join("sessions"), Box::new(sinks));

        let session = recorder.begin_session(64, 48, 20.0).unwrap();
        assert!(session.folder.is_dir());
        assert!(session.folder.starts_with(dir.path().join("sessions")));
        assert_eq!(session.video_path, session.folder.join(VIDEO_FILE_NAME));
        assert_eq!(recorder.active_session(), Some(session.clone()));
        assert_eq!(recorder.sessions(), vec![session]);
        assert_eq!(log.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frames_reach_the_active_sink_until_end() {
        let dir = tempdir().unwrap();
        let sinks = MemorySinkFactory::default();
        let log = sinks.log();
        let recorder = SessionRecorder::new(dir.path(), Box::new(sinks));
        recorder.begin_session(8, 8, 20.0).unwrap();

        let frame = solid_image(8, 8, [0, 0, 0]);
        recorder.write_frame(&frame).unwrap();
        recorder.write_frame(&frame).unwrap();
        let closed = recorder.end_session().unwrap();

        assert!(closed.is_some());
        assert_eq!(log.frames.load(Ordering::SeqCst), 2);
        assert_eq!(log.finished.load(Ordering::SeqCst), 1);
        assert!(recorder.active_session().is_none());
        assert!(closed.unwrap().folder.is_dir());
    }

    #[test]
    fn writing_without_session_is_reported() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), Box::new(MemorySinkFactory::default()));
        let err = recorder.write_frame(&solid_image(4, 4, [0, 0, 0])).unwrap_err();
        assert!(matches!(err, RecorderError::NoActiveSession));
    }

    #[test]
    fn end_session_is_idempotent() {
        let dir = tempdir().unwrap();
        let sinks = MemorySinkFactory::default();
        let log = sinks.log();
        let recorder = SessionRecorder::new(dir.path(), Box::new(sinks));
        assert!(recorder.end_session().unwrap().is_none());
        recorder.begin_session(8, 8, 20.0).unwrap();
        assert!(recorder.end_session().unwrap().is_some());
        assert!(recorder.end_session().unwrap().is_none());
        assert_eq!(log.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn new_session_closes_previous_and_gets_its_own_folder() {
        let dir = tempdir().unwrap();
        let sinks = MemorySinkFactory::default();
        let log = sinks.log();
        let recorder = Arc::new(SessionRecorder::new(dir.path(), Box::new(sinks)));

        let first = recorder.begin_session(8, 8, 20.0).unwrap();
        let second = recorder.begin_session(8, 8, 20.0).unwrap();

        assert_ne!(first.folder, second.folder);
        assert_eq!(log.finished.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.active_session(), Some(second.clone()));
        assert_eq!(recorder.latest_session(), Some(second));
        assert_eq!(recorder.sessions().len(), 2);
    }

    #[test]
    fn sink_failure_leaves_no_session_behind() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), Box::new(FailingSinkFactory));
        let err = recorder.begin_session(8, 8, 20.0).unwrap_err();
        assert!(matches!(err, RecorderError::OpenSink(_)));
        assert!(recorder.sessions().is_empty());
        assert!(recorder.active_session().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unwritable_root_is_a_create_dir_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let recorder = SessionRecorder::new(blocker.join("sessions"), Box::new(MemorySinkFactory::default()));
        let err = recorder.begin_session(8, 8, 20.0).unwrap_err();
        assert!(matches!(err, RecorderError::CreateDir { .. }));
    }
}
