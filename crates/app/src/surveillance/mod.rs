//! Camera surveillance service: a detection loop that alerts on weapons and
//! fire, records each run to disk, and is driven over HTTP.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Wires every component together and handles shutdown.
//! - `controller`: Detection loop state machine and per-frame driver.
//! - `detection`: Alert policy for primary detections and the colour heuristic.
//! - `heuristics`: HSV flame detector for small fire sources.
//! - `alerts`: Append-only alert ledger with CSV export.
//! - `recorder`: Session folders and video sinks.
//! - `preview`: Single-slot buffer behind the live feed.
//! - `server`: Actix Web control surface.
//! - `source`: Frame source plumbing over the capture backends.
//! - `geolocation`: IP geolocation with a timeout and circuit breaker.
//! - `sound`: Fire-and-forget audible alerts.
//! - `annotation`: Drawing primitives and JPEG encoding.
//! - `telemetry`: Tracing subscriber, Prometheus recorder, thread helper.

pub use config::{ServeArgs, SurveillanceConfig};
pub use pipeline::run;

mod alerts;
mod annotation;
mod config;
mod controller;
mod detection;
mod geolocation;
mod heuristics;
mod pipeline;
mod preview;
mod recorder;
mod server;
mod sound;
mod source;
mod telemetry;
#[cfg(test)]
mod testing;
