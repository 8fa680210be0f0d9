//! Append-only alert ledger shared by the detection loop and HTTP handlers.
//!
//! A single mutex guards both id assignment and append so readers never see a
//! half-recorded event and ids follow lock acquisition order.

use std::{
    fmt,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum AlertCategory {
    Info,
    Fire,
    Weapon,
}

impl AlertCategory {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AlertCategory::Info => "info",
            AlertCategory::Fire => "fire",
            AlertCategory::Weapon => "weapon",
        }
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable alert. Field order is also the CSV column order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct AlertEvent {
    pub(crate) id: u64,
    #[serde(with = "timestamp_format")]
    pub(crate) timestamp: NaiveDateTime,
    pub(crate) message: String,
    pub(crate) category: AlertCategory,
}

mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub(super) fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(FORMAT))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(D::Error::custom)
    }
}

#[derive(Debug, Error)]
pub(crate) enum LedgerError {
    #[error("failed to write alert CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to flush alert CSV: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of an export request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ExportOutcome {
    Written { rows: usize },
    NothingToExport,
}

struct LedgerState {
    next_id: u64,
    events: Vec<AlertEvent>,
}

pub(crate) struct AlertLedger {
    state: Mutex<LedgerState>,
}

impl AlertLedger {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                next_id: 1,
                events: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // Events are only pushed whole, so a panicked holder cannot leave a
        // partial append behind.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next id, stamp the current time, and append.
    pub(crate) fn record(&self, message: impl Into<String>, category: AlertCategory) -> AlertEvent {
        let event = {
            let mut state = self.lock();
            let event = AlertEvent {
                id: state.next_id,
                timestamp: Local::now().naive_local().trunc_subsecs(0),
                message: message.into(),
                category,
            };
            state.next_id += 1;
            state.events.push(event.clone());
            event
        };
        metrics::counter!("surveillance_alerts_total", "category" => category.as_str()).increment(1);
        info!(id = event.id, category = %event.category, "Alert: {}", event.message);
        event
    }

    /// All events in insertion order.
    pub(crate) fn snapshot(&self) -> Vec<AlertEvent> {
        self.lock().events.clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().events.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the current snapshot as CSV, or `None` when there is nothing to
    /// export.
    pub(crate) fn to_csv(&self) -> Result<Option<Vec<u8>>, LedgerError> {
        let events = self.snapshot();
        if events.is_empty() {
            return Ok(None);
        }
        let mut writer = csv::Writer::from_writer(Vec::new());
        for event in &events {
            writer.serialize(event)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| LedgerError::Io(err.into_error()))?;
        Ok(Some(bytes))
    }

    /// Write the current snapshot to `destination`. An empty ledger touches
    /// nothing on disk.
    pub(crate) fn export_csv(&self, destination: &Path) -> Result<ExportOutcome, LedgerError> {
        let events = self.snapshot();
        if events.is_empty() {
            return Ok(ExportOutcome::NothingToExport);
        }
        let mut writer = csv::Writer::from_path(destination)?;
        for event in &events {
            writer.serialize(event)?;
        }
        writer.flush()?;
        info!("Alerts saved: {}", destination.display());
        Ok(ExportOutcome::Written { rows: events.len() })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use tempfile::tempdir;

    use super::*;

    const CSV_HEADER: [&str; 4] = ["id", "timestamp", "message", "category"];

    #[test]
    fn ids_start_at_one_and_increase() {
        let ledger = AlertLedger::new();
        let first = ledger.record("Smart Surveillance started", AlertCategory::Info);
        let second = ledger.record("knife detected (conf 0.90)", AlertCategory::Weapon);
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(second.category, AlertCategory::Weapon);
        assert_eq!(second.message, "knife detected (conf 0.90)");
    }

    #[test]
    fn concurrent_records_get_unique_gapless_ids() {
        let ledger = Arc::new(AlertLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|n| ledger.record(format!("w{worker}-{n}"), AlertCategory::Info).id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("worker panicked"))
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=400).collect::<Vec<_>>());

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.len(), 400);
        assert!(snapshot.windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    #[test]
    fn snapshot_preserves_supplied_fields() {
        let ledger = AlertLedger::new();
        ledger.record("Small flame/matchstick detected", AlertCategory::Fire);
        ledger.record("Frame read failed", AlertCategory::Info);
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].message, "Small flame/matchstick detected");
        assert_eq!(snapshot[0].category, AlertCategory::Fire);
        assert_eq!(snapshot[1].category, AlertCategory::Info);
    }

    #[test]
    fn empty_ledger_exports_nothing() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("alerts.csv");
        let ledger = AlertLedger::new();
        assert_eq!(ledger.export_csv(&target).unwrap(), ExportOutcome::NothingToExport);
        assert!(!target.exists());
        assert!(ledger.to_csv().unwrap().is_none());
    }

    #[test]
    fn export_writes_header_and_one_row_per_event() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("alerts.csv");
        let ledger = AlertLedger::new();
        ledger.record("gun detected (conf 0.77)", AlertCategory::Weapon);
        ledger.record("GPS Location: 51.5074, -0.1278", AlertCategory::Info);
        ledger.record("Frame read failed", AlertCategory::Info);

        assert_eq!(
            ledger.export_csv(&target).unwrap(),
            ExportOutcome::Written { rows: 3 }
        );

        let mut reader = csv::Reader::from_path(&target).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, CSV_HEADER);
        let rows: Vec<AlertEvent> = reader.deserialize().map(|row| row.unwrap()).collect();
        assert_eq!(rows, ledger.snapshot());
    }

    #[test]
    fn in_memory_csv_matches_file_export() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("alerts.csv");
        let ledger = AlertLedger::new();
        ledger.record("fire detected (conf 0.50)", AlertCategory::Fire);
        ledger.export_csv(&target).unwrap();
        let bytes = ledger.to_csv().unwrap().unwrap();
        assert_eq!(bytes, std::fs::read(&target).unwrap());
    }
}
