//! Per-frame alert policy: which detections raise alerts, what side effects
//! follow, and how the final frame is composed.

use image::RgbImage;
use ml_core::{Detection, DetectorError, ObjectDetector};
use thiserror::Error;
use tracing::debug;

use crate::surveillance::{
    alerts::{AlertCategory, AlertLedger},
    annotation,
    geolocation::{Coordinates, GeolocationGuard},
    heuristics,
    recorder::RecorderError,
    sound::Alerter,
};

/// Detections scoring at or above this are considered.
pub(crate) const CONFIDENCE_THRESHOLD: f32 = 0.35;

pub(crate) const RESTRICTED_CLASSES: [&str; 8] = [
    "knife", "gun", "pistol", "rifle", "firearm", "fire", "flame", "smoke",
];

const FIRE_CLASSES: [&str; 2] = ["fire", "flame"];

pub(crate) const SMALL_FIRE_MESSAGE: &str = "Small flame/matchstick detected";

#[derive(Debug, Error)]
pub(crate) enum PipelineError {
    #[error("malformed frame: {0}")]
    Frame(#[source] anyhow::Error),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

/// Alert category for a detection, or `None` if it should not alert.
pub(crate) fn restricted_category(label: &str, score: f32) -> Option<AlertCategory> {
    if score < CONFIDENCE_THRESHOLD {
        return None;
    }
    let label = label.to_lowercase();
    if !RESTRICTED_CLASSES.contains(&label.as_str()) {
        return None;
    }
    if FIRE_CLASSES.contains(&label.as_str()) {
        Some(AlertCategory::Fire)
    } else {
        Some(AlertCategory::Weapon)
    }
}

pub(crate) fn detection_message(detection: &Detection) -> String {
    format!(
        "{} detected (conf {:.2})",
        detection.label.to_lowercase(),
        detection.score
    )
}

/// Borrowed collaborators the per-frame policy reports through.
pub(crate) struct AnalysisContext<'a> {
    pub(crate) ledger: &'a AlertLedger,
    pub(crate) geolocation: &'a GeolocationGuard,
    pub(crate) alerter: &'a dyn Alerter,
    pub(crate) verbose: bool,
}

impl AnalysisContext<'_> {
    /// Record one alert and run its side effects. Returns the position that
    /// should be drawn on the frame, if one was found.
    fn raise(&self, message: String, category: AlertCategory) -> Option<Coordinates> {
        self.ledger.record(message, category);
        self.alerter.play();
        let coords = self.geolocation.lookup()?;
        self.ledger
            .record(format!("GPS Location: {coords}"), AlertCategory::Info);
        Some(coords)
    }
}

pub(crate) struct AnalyzedFrame {
    pub(crate) image: RgbImage,
    pub(crate) alerts: usize,
}

/// Run both detectors over `raw`, raise alerts, and compose the frame that is
/// previewed and recorded.
pub(crate) fn analyze_frame(
    ctx: &AnalysisContext<'_>,
    detector: &mut dyn ObjectDetector,
    raw: RgbImage,
) -> Result<AnalyzedFrame, PipelineError> {
    let output = detector.detect(&raw)?;
    let mut alerts = 0;
    let mut banner = None;

    for detection in &output.detections {
        if ctx.verbose {
            debug!(
                label = %detection.label,
                score = detection.score,
                bbox = ?detection.bbox,
                "detection"
            );
        }
        let Some(category) = restricted_category(&detection.label, detection.score) else {
            continue;
        };
        alerts += 1;
        if let Some(coords) = ctx.raise(detection_message(detection), category) {
            banner = Some(coords);
        }
    }

    let regions = heuristics::detect_small_fire(&raw);
    if !regions.is_empty() {
        debug!("colour heuristic flagged {} region(s)", regions.len());
        alerts += 1;
        if let Some(coords) = ctx.raise(SMALL_FIRE_MESSAGE.to_string(), AlertCategory::Fire) {
            banner = Some(coords);
        }
    }

    let mut image = match output.annotated {
        Some(rendered) if rendered.dimensions() == raw.dimensions() => rendered,
        _ => {
            let mut canvas = raw;
            annotation::draw_detections(&mut canvas, &output.detections);
            canvas
        }
    };
    annotation::draw_regions(&mut image, &regions);
    if let Some(coords) = banner {
        annotation::draw_gps_banner(&mut image, coords);
    }

    Ok(AnalyzedFrame { image, alerts })
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use image::Rgb;

    use super::*;
    use crate::surveillance::{
        annotation::{DETECTION_COLOR, FIRE_REGION_COLOR, GPS_COLOR},
        geolocation::DisabledGeolocator,
        testing::{CountingAlerter, FixedGeolocator, ScriptedDetector, solid_image},
    };

    fn guard(geolocator: FixedGeolocator) -> GeolocationGuard {
        GeolocationGuard::new(Box::new(geolocator), Duration::from_secs(60), Duration::from_secs(30))
    }

    fn no_gps() -> GeolocationGuard {
        GeolocationGuard::new(Box::new(DisabledGeolocator), Duration::ZERO, Duration::ZERO)
    }

    fn knife(score: f32) -> Detection {
        Detection::new("knife", score, [40.0, 40.0, 120.0, 100.0])
    }

    #[test]
    fn threshold_is_inclusive() {
        assert_eq!(restricted_category("knife", 0.35), Some(AlertCategory::Weapon));
        assert_eq!(restricted_category("knife", 0.349_999), None);
    }

    #[test]
    fn fire_terms_map_to_fire_and_the_rest_to_weapon() {
        assert_eq!(restricted_category("fire", 0.9), Some(AlertCategory::Fire));
        assert_eq!(restricted_category("Flame", 0.9), Some(AlertCategory::Fire));
        assert_eq!(restricted_category("firearm", 0.9), Some(AlertCategory::Weapon));
        assert_eq!(restricted_category("smoke", 0.9), Some(AlertCategory::Weapon));
        assert_eq!(restricted_category("GUN", 0.9), Some(AlertCategory::Weapon));
    }

    #[test]
    fn unrestricted_labels_never_alert() {
        for score in [0.0, 0.35, 0.99, 1.0] {
            assert_eq!(restricted_category("person", score), None);
            assert_eq!(restricted_category("scissors", score), None);
        }
    }

    #[test]
    fn message_uses_two_decimals() {
        assert_eq!(detection_message(&knife(0.9)), "knife detected (conf 0.90)");
    }

    #[test]
    fn knife_without_fix_records_one_weapon_alert() {
        let ledger = AlertLedger::new();
        let geo = no_gps();
        let alerter = CountingAlerter::default();
        let plays = alerter.plays();
        let ctx = AnalysisContext {
            ledger: &ledger,
            geolocation: &geo,
            alerter: &alerter,
            verbose: true,
        };
        let mut detector = ScriptedDetector::always(vec![knife(0.9)]);

        let analyzed = analyze_frame(&ctx, &mut detector, solid_image(160, 120, [0, 0, 0])).unwrap();

        let events = ledger.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, AlertCategory::Weapon);
        assert_eq!(events[0].message, "knife detected (conf 0.90)");
        assert_eq!(analyzed.alerts, 1);
        assert_eq!(plays.load(Ordering::SeqCst), 1);
        assert_eq!(analyzed.image.get_pixel(40, 70), &DETECTION_COLOR);
    }

    #[test]
    fn knife_with_fix_adds_location_alert_and_banner() {
        let ledger = AlertLedger::new();
        let geo = guard(FixedGeolocator::found(Coordinates::new(51.5074, -0.1278)));
        let alerter = CountingAlerter::default();
        let ctx = AnalysisContext {
            ledger: &ledger,
            geolocation: &geo,
            alerter: &alerter,
            verbose: false,
        };
        let mut detector = ScriptedDetector::always(vec![knife(0.9)]);

        let analyzed = analyze_frame(&ctx, &mut detector, solid_image(320, 240, [0, 0, 0])).unwrap();

        let events = ledger.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].category, AlertCategory::Weapon);
        assert_eq!(events[1].category, AlertCategory::Info);
        assert_eq!(events[1].message, "GPS Location: 51.5074, -0.1278");
        assert_eq!(analyzed.image.get_pixel(20, 50), &GPS_COLOR);
    }

    #[test]
    fn failed_lookup_still_alerts() {
        let ledger = AlertLedger::new();
        let geo = guard(FixedGeolocator::failing());
        let alerter = CountingAlerter::default();
        let ctx = AnalysisContext {
            ledger: &ledger,
            geolocation: &geo,
            alerter: &alerter,
            verbose: false,
        };
        let mut detector = ScriptedDetector::always(vec![Detection::new("gun", 0.5, [0.0, 0.0, 10.0, 10.0])]);
        analyze_frame(&ctx, &mut detector, solid_image(32, 32, [0, 0, 0])).unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn below_threshold_and_unrestricted_detections_are_only_drawn() {
        let ledger = AlertLedger::new();
        let geo = no_gps();
        let alerter = CountingAlerter::default();
        let plays = alerter.plays();
        let ctx = AnalysisContext {
            ledger: &ledger,
            geolocation: &geo,
            alerter: &alerter,
            verbose: false,
        };
        let mut detector = ScriptedDetector::always(vec![
            knife(0.2),
            Detection::new("person", 0.99, [5.0, 5.0, 30.0, 30.0]),
        ]);
        let analyzed = analyze_frame(&ctx, &mut detector, solid_image(160, 120, [0, 0, 0])).unwrap();
        assert!(ledger.is_empty());
        assert_eq!(analyzed.alerts, 0);
        assert_eq!(plays.load(Ordering::SeqCst), 0);
        assert_eq!(analyzed.image.get_pixel(5, 20), &DETECTION_COLOR);
    }

    #[test]
    fn orange_patch_raises_fire_alert_and_outline() {
        let ledger = AlertLedger::new();
        let geo = no_gps();
        let alerter = CountingAlerter::default();
        let ctx = AnalysisContext {
            ledger: &ledger,
            geolocation: &geo,
            alerter: &alerter,
            verbose: false,
        };
        let mut raw = solid_image(80, 60, [0, 0, 0]);
        for y in 20..32 {
            for x in 30..42 {
                raw.put_pixel(x, y, Rgb([255, 140, 0]));
            }
        }
        let mut detector = ScriptedDetector::nothing();
        let analyzed = analyze_frame(&ctx, &mut detector, raw).unwrap();

        let events = ledger.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, AlertCategory::Fire);
        assert_eq!(events[0].message, SMALL_FIRE_MESSAGE);
        assert_eq!(analyzed.alerts, 1);
        assert_eq!(analyzed.image.get_pixel(30, 26), &FIRE_REGION_COLOR);
    }

    #[test]
    fn detector_rendering_is_preferred_when_sizes_match() {
        let ledger = AlertLedger::new();
        let geo = no_gps();
        let alerter = CountingAlerter::default();
        let ctx = AnalysisContext {
            ledger: &ledger,
            geolocation: &geo,
            alerter: &alerter,
            verbose: false,
        };

        let mut detector = ScriptedDetector::nothing().with_annotation(solid_image(16, 16, [9, 9, 9]));
        let analyzed = analyze_frame(&ctx, &mut detector, solid_image(16, 16, [0, 0, 0])).unwrap();
        assert_eq!(analyzed.image.get_pixel(8, 8), &Rgb([9, 9, 9]));

        let mut detector = ScriptedDetector::nothing().with_annotation(solid_image(8, 8, [9, 9, 9]));
        let analyzed = analyze_frame(&ctx, &mut detector, solid_image(16, 16, [0, 0, 0])).unwrap();
        assert_eq!(analyzed.image.dimensions(), (16, 16));
        assert_eq!(analyzed.image.get_pixel(8, 8), &Rgb([0, 0, 0]));
    }

    #[test]
    fn detector_failure_is_reported() {
        let ledger = AlertLedger::new();
        let geo = no_gps();
        let alerter = CountingAlerter::default();
        let ctx = AnalysisContext {
            ledger: &ledger,
            geolocation: &geo,
            alerter: &alerter,
            verbose: false,
        };
        let mut detector = ScriptedDetector::failing();
        let result = analyze_frame(&ctx, &mut detector, solid_image(8, 8, [0, 0, 0]));
        assert!(matches!(result, Err(PipelineError::Detector(_))));
    }
}
