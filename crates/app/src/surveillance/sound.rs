//! Audible alert side effect.
//!
//! `play` never blocks and never reports failure: the player runs on its own
//! thread and any error it hits is logged at debug level and dropped.

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::surveillance::telemetry;

pub(crate) trait Alerter: Send + Sync {
    /// Fire-and-forget.
    fn play(&self);
}

/// Alerter used when no sound file is configured.
pub(crate) struct SilentAlerter;

impl Alerter for SilentAlerter {
    fn play(&self) {}
}

/// Plays a sound file through an external player such as `ffplay`, `aplay`
/// or `paplay`.
pub(crate) struct SoundAlerter {
    player: String,
    sound: PathBuf,
    cooldown: Duration,
    last_played: Mutex<Option<Instant>>,
}

impl SoundAlerter {
    pub(crate) fn new(player: impl Into<String>, sound: impl Into<PathBuf>, cooldown: Duration) -> Self {
        Self {
            player: player.into(),
            sound: sound.into(),
            cooldown,
            last_played: Mutex::new(None),
        }
    }

    /// Bursts of detections inside `cooldown` collapse into one playback.
    fn claim_slot(&self, now: Instant) -> bool {
        let mut last = self.last_played.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(previous) if now.duration_since(previous) < self.cooldown => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.player);
        let is_ffplay = Path::new(&self.player)
            .file_stem()
            .is_some_and(|stem| stem == "ffplay");
        if is_ffplay {
            cmd.arg("-nodisp").arg("-autoexit").arg("-loglevel").arg("quiet");
        }
        cmd.arg(&self.sound)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl Alerter for SoundAlerter {
    fn play(&self) {
        if !self.claim_slot(Instant::now()) {
            return;
        }
        let mut cmd = self.command();
        let spawned = telemetry::spawn_thread("alert-sound", move || match cmd.status() {
            Ok(status) if !status.success() => debug!("alert sound player exited with {status}"),
            Ok(_) => {}
            Err(err) => debug!("alert sound failed: {err}"),
        });
        if let Err(err) = spawned {
            debug!("could not spawn alert sound thread: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_collapses_bursts() {
        let alerter = SoundAlerter::new("ffplay", "beep.mp3", Duration::from_secs(1));
        let start = Instant::now();
        assert!(alerter.claim_slot(start));
        assert!(!alerter.claim_slot(start + Duration::from_millis(500)));
        assert!(alerter.claim_slot(start + Duration::from_millis(1500)));
    }

    #[test]
    fn ffplay_gets_headless_flags() {
        let alerter = SoundAlerter::new("/usr/bin/ffplay", "beep.mp3", Duration::ZERO);
        let args: Vec<_> = alerter
            .command()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["-nodisp", "-autoexit", "-loglevel", "quiet", "beep.mp3"]);
    }

    #[test]
    fn other_players_only_get_the_file() {
        let alerter = SoundAlerter::new("aplay", "beep.wav", Duration::ZERO);
        let args: Vec<_> = alerter
            .command()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["beep.wav"]);
    }

    #[test]
    fn missing_player_is_silently_ignored() {
        let alerter = SoundAlerter::new("definitely-not-a-player-binary", "beep.mp3", Duration::ZERO);
        alerter.play();
    }
}
