//! Best-effort IP geolocation for alert annotations.
//!
//! Lookups happen on the detection loop's thread, so every request carries a
//! timeout and [`GeolocationGuard`] keeps repeated failures off the hot path.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Coordinates {
    pub(crate) latitude: f64,
    pub(crate) longitude: f64,
}

impl Coordinates {
    pub(crate) fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// `(0, 0)` is what lookup services return when they know nothing.
    pub(crate) fn is_trivial(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}, {:.4}", self.latitude, self.longitude)
    }
}

#[derive(Debug, Error)]
pub(crate) enum GeoError {
    #[error("geolocation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("geolocation service reported no fix: {0}")]
    NoFix(String),
    #[error("geolocation disabled")]
    Disabled,
}

pub(crate) trait Geolocator: Send + Sync {
    fn locate(&self) -> Result<Coordinates, GeoError>;
}

/// Looks up the public IP's approximate position through an ip-api style
/// JSON endpoint.
pub(crate) struct IpGeolocator {
    client: Client,
    url: String,
}

impl IpGeolocator {
    pub(crate) fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, GeoError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: Option<String>,
    message: Option<String>,
    #[serde(alias = "latitude")]
    lat: Option<f64>,
    #[serde(alias = "longitude")]
    lon: Option<f64>,
}

fn parse_ip_api(body: &str) -> Result<Coordinates, GeoError> {
    let response: IpApiResponse =
        serde_json::from_str(body).map_err(|err| GeoError::NoFix(err.to_string()))?;
    if let Some(status) = response.status.as_deref() {
        if status != "success" {
            return Err(GeoError::NoFix(
                response.message.unwrap_or_else(|| status.to_string()),
            ));
        }
    }
    match (response.lat, response.lon) {
        (Some(lat), Some(lon)) => Ok(Coordinates::new(lat, lon)),
        _ => Err(GeoError::NoFix("response carried no coordinates".into())),
    }
}

impl Geolocator for IpGeolocator {
    fn locate(&self) -> Result<Coordinates, GeoError> {
        let body = self
            .client
            .get(&self.url)
            .send()?
            .error_for_status()?
            .text()?;
        parse_ip_api(&body)
    }
}

/// Used when geolocation is switched off.
pub(crate) struct DisabledGeolocator;

impl Geolocator for DisabledGeolocator {
    fn locate(&self) -> Result<Coordinates, GeoError> {
        Err(GeoError::Disabled)
    }
}

#[derive(Default)]
struct GuardState {
    cached: Option<(Coordinates, Instant)>,
    open_until: Option<Instant>,
}

/// Caching circuit breaker around a [`Geolocator`].
///
/// A fix is reused for `ttl`; after a failure no request is attempted for
/// `cooldown`. Errors never escape: callers just get `None`.
pub(crate) struct GeolocationGuard {
    inner: Box<dyn Geolocator>,
    ttl: Duration,
    cooldown: Duration,
    state: Mutex<GuardState>,
}

impl GeolocationGuard {
    pub(crate) fn new(inner: Box<dyn Geolocator>, ttl: Duration, cooldown: Duration) -> Self {
        Self {
            inner,
            ttl,
            cooldown,
            state: Mutex::new(GuardState::default()),
        }
    }

    /// Current position if one is known and non-trivial.
    pub(crate) fn lookup(&self) -> Option<Coordinates> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some((coords, at)) = state.cached {
            if now.duration_since(at) < self.ttl {
                return Some(coords);
            }
        }
        if let Some(until) = state.open_until {
            if now < until {
                return None;
            }
        }

        match self.inner.locate() {
            Ok(coords) if !coords.is_trivial() => {
                state.cached = Some((coords, now));
                state.open_until = None;
                Some(coords)
            }
            Ok(_) => {
                debug!("Geolocation returned a trivial coordinate; ignoring");
                state.open_until = Some(now + self.cooldown);
                None
            }
            Err(GeoError::Disabled) => None,
            Err(err) => {
                metrics::counter!("surveillance_geolocation_failures_total").increment(1);
                warn!("GPS error: {err}");
                state.open_until = Some(now + self.cooldown);
                None
            }
        }
    }
}
