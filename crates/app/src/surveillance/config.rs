//! Translation of `serve` flags into a validated [`SurveillanceConfig`].

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};

/// Capture and recording backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum VideoBackend {
    /// `ffmpeg` subprocesses for both capture and MP4 encoding.
    #[default]
    Ffmpeg,
    /// OpenCV `VideoCapture` / `VideoWriter`.
    #[cfg(feature = "with-opencv")]
    Opencv,
}

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing loop and frame spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct GeolocationSettings {
    /// Lookup endpoint; `None` disables geolocation.
    pub url: Option<String>,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub failure_cooldown: Duration,
}

#[derive(Clone, Debug)]
pub struct SurveillanceConfig {
    /// Camera index, device path, file, or stream URI.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub backend: VideoBackend,
    pub first_frame_timeout: Duration,
    /// TorchScript detector; `None` runs the colour heuristic only.
    pub model_path: Option<PathBuf>,
    pub use_cpu: bool,
    pub sessions_dir: PathBuf,
    pub bind: SocketAddr,
    pub sound: Option<PathBuf>,
    pub sound_player: String,
    pub sound_cooldown: Duration,
    pub geolocation: GeolocationSettings,
    pub jpeg_quality: u8,
    pub frame_pause: Duration,
    pub verbose: bool,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Camera index (`0`), device path, video file, or rtsp:// URI.
    #[arg(long, value_name = "URI", default_value = "0")]
    pub source: String,
    /// Capture and recording width in pixels.
    #[arg(long, value_name = "PX", default_value_t = 640)]
    pub width: u32,
    /// Capture and recording height in pixels.
    #[arg(long, value_name = "PX", default_value_t = 480)]
    pub height: u32,
    /// Recording frame rate.
    #[arg(long, value_name = "FPS", default_value_t = 20.0)]
    pub fps: f64,
    /// Capture and recording backend.
    #[arg(long, value_enum, default_value_t = VideoBackend::Ffmpeg)]
    pub backend: VideoBackend,
    /// How long to wait for the first frame before declaring the camera
    /// unopenable. Later reads that stall this long fail the loop.
    #[arg(long = "first-frame-timeout-ms", value_name = "MS", default_value_t = 5_000)]
    pub first_frame_timeout_ms: u64,
    /// TorchScript YOLO model (requires the `with-tch` feature).
    #[arg(long, value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Root directory for session folders.
    #[arg(long = "sessions-dir", value_name = "DIR", default_value = "sessions")]
    pub sessions_dir: PathBuf,
    /// HTTP listen address.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:5000")]
    pub bind: SocketAddr,
    /// Sound file played on every alert.
    #[arg(long, value_name = "PATH")]
    pub sound: Option<PathBuf>,
    /// External player used for `--sound`.
    #[arg(long = "sound-player", value_name = "CMD", default_value = "ffplay")]
    pub sound_player: String,
    /// IP geolocation endpoint (ip-api.com JSON format).
    #[arg(long = "geolocation-url", value_name = "URL", default_value = "http://ip-api.com/json")]
    pub geolocation_url: String,
    /// Per-request geolocation timeout.
    #[arg(long = "geolocation-timeout-ms", value_name = "MS", default_value_t = 1_500)]
    pub geolocation_timeout_ms: u64,
    /// Skip geolocation lookups entirely.
    #[arg(long = "no-geolocation", action = clap::ArgAction::SetTrue)]
    pub no_geolocation: bool,
    /// JPEG quality of the live preview (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 80)]
    pub jpeg_quality: u8,
    /// Pause between frames.
    #[arg(long = "frame-pause-ms", value_name = "MS", default_value_t = 10)]
    pub frame_pause_ms: u64,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Log every detection, not only alerts.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<ServeArgs> for SurveillanceConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        if args.source.trim().is_empty() {
            bail!("--source must not be empty");
        }
        if args.width == 0 || args.height == 0 {
            bail!("Capture width and height must be positive integers");
        }
        if args.width % 2 != 0 || args.height % 2 != 0 {
            bail!("Capture width and height must be even for MP4 recording");
        }
        if !args.fps.is_finite() || args.fps <= 0.0 {
            bail!("--fps must be a positive number");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.first_frame_timeout_ms == 0 {
            bail!("--first-frame-timeout-ms must be at least 1");
        }
        if args.geolocation_timeout_ms == 0 {
            bail!("--geolocation-timeout-ms must be at least 1");
        }
        if args.model.is_some() && !cfg!(feature = "with-tch") {
            bail!("--model requires a build with the `with-tch` feature");
        }
        if args.sound_player.trim().is_empty() {
            bail!("--sound-player must not be empty");
        }

        let geolocation = GeolocationSettings {
            url: (!args.no_geolocation).then_some(args.geolocation_url),
            timeout: Duration::from_millis(args.geolocation_timeout_ms),
            cache_ttl: Duration::from_secs(60),
            failure_cooldown: Duration::from_secs(30),
        };

        Ok(Self {
            source: args.source,
            width: args.width,
            height: args.height,
            fps: args.fps,
            backend: args.backend,
            first_frame_timeout: Duration::from_millis(args.first_frame_timeout_ms),
            model_path: args.model,
            use_cpu: args.use_cpu,
            sessions_dir: args.sessions_dir,
            bind: args.bind,
            sound: args.sound,
            sound_player: args.sound_player,
            sound_cooldown: Duration::from_secs(1),
            geolocation,
            jpeg_quality: args.jpeg_quality,
            frame_pause: Duration::from_millis(args.frame_pause_ms),
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}
