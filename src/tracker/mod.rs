// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Unified in-memory download tracker.
//!
//! Single source of truth for what every dispatched download is doing
//! right now. All mutation happens under one lock; reads hand out
//! copies, never the live map, so callers can iterate freely while
//! downloads keep updating. Terminal entries (finished, error,
//! canceled) are retained for a grace period and then evicted.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::sync::resilient_lock;

/// Cap on retained speed samples per download.
const MAX_SPEED_SAMPLES: usize = 50;

/// Cap on retained progress-history snapshots per download.
const MAX_HISTORY_SNAPSHOTS: usize = 120;

/// Lifecycle status of a dispatched download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Starting,
    Downloading,
    Finished,
    Error,
    Canceled,
}

impl DownloadStatus {
    /// Returns true once the download can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Finished | DownloadStatus::Error | DownloadStatus::Canceled
        )
    }
}

/// One point-in-time progress observation.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub timestamp: DateTime<Utc>,
    pub percent: Option<String>,
    pub downloaded: Option<String>,
    pub total: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

/// Live/terminal state record for one dispatched download.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadEntry {
    pub status: DownloadStatus,
    pub percent: Option<String>,
    pub downloaded: Option<String>,
    pub total: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    /// ETA recomputed from recent speed samples rather than the
    /// downloader's instantaneous figure.
    pub improved_eta: Option<String>,
    pub speeds: Vec<String>,
    pub history: Vec<ProgressSnapshot>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub metadata: serde_json::Map<String, Value>,
    pub error: Option<String>,
}

impl DownloadEntry {
    fn new(status: DownloadStatus) -> Self {
        let now = Utc::now();
        Self {
            status,
            percent: None,
            downloaded: None,
            total: None,
            speed: None,
            eta: None,
            improved_eta: None,
            speeds: Vec::new(),
            history: Vec::new(),
            start_time: now,
            last_update: now,
            metadata: serde_json::Map::new(),
            error: None,
        }
    }
}

/// Field merge applied by [`DownloadTracker::update`]. Only set fields
/// overwrite; everything else is left as-is.
#[derive(Debug, Default)]
pub struct TrackerUpdate {
    pub status: Option<DownloadStatus>,
    pub percent: Option<String>,
    pub downloaded: Option<String>,
    pub total: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub improved_eta: Option<String>,
    pub speed_sample: Option<String>,
    pub snapshot: Option<ProgressSnapshot>,
    pub metadata: Option<serde_json::Map<String, Value>>,
    pub error: Option<String>,
}

impl TrackerUpdate {
    pub fn status(status: DownloadStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Thread-safe table of download state keyed by download id.
#[derive(Default)]
pub struct DownloadTracker {
    entries: Mutex<HashMap<String, DownloadEntry>>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `update` into the entry for `id`, creating it if absent.
    /// Always refreshes `last_update`.
    pub fn update(&self, id: &str, update: TrackerUpdate) {
        let mut entries = resilient_lock(&self.entries);
        let entry = entries
            .entry(id.to_string())
            .or_insert_with(|| DownloadEntry::new(update.status.unwrap_or(DownloadStatus::Starting)));

        if let Some(status) = update.status {
            entry.status = status;
        }
        if update.percent.is_some() {
            entry.percent = update.percent;
        }
        if update.downloaded.is_some() {
            entry.downloaded = update.downloaded;
        }
        if update.total.is_some() {
            entry.total = update.total;
        }
        if update.speed.is_some() {
            entry.speed = update.speed;
        }
        if update.eta.is_some() {
            entry.eta = update.eta;
        }
        if update.improved_eta.is_some() {
            entry.improved_eta = update.improved_eta;
        }
        if let Some(sample) = update.speed_sample {
            entry.speeds.push(sample);
            if entry.speeds.len() > MAX_SPEED_SAMPLES {
                entry.speeds.remove(0);
            }
        }
        if let Some(snapshot) = update.snapshot {
            entry.history.push(snapshot);
            if entry.history.len() > MAX_HISTORY_SNAPSHOTS {
                entry.history.remove(0);
            }
        }
        if let Some(metadata) = update.metadata {
            for (k, v) in metadata {
                entry.metadata.insert(k, v);
            }
        }
        if update.error.is_some() {
            entry.error = update.error;
        }
        entry.last_update = Utc::now();
    }

    /// Copy of the entry for `id`, if any.
    pub fn get(&self, id: &str) -> Option<DownloadEntry> {
        resilient_lock(&self.entries).get(id).cloned()
    }

    /// Read-only snapshot of every tracked download.
    pub fn summary(&self) -> HashMap<String, DownloadEntry> {
        resilient_lock(&self.entries).clone()
    }

    /// Ids of every tracked download.
    pub fn ids(&self) -> HashSet<String> {
        resilient_lock(&self.entries).keys().cloned().collect()
    }

    /// Remove the entry for `id`. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        resilient_lock(&self.entries).remove(id).is_some()
    }

    /// Evict terminal entries whose last update is older than `ttl`.
    /// Returns the number of entries removed.
    pub fn cleanup_finished(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut entries = resilient_lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| !(e.status.is_terminal() && e.last_update < cutoff));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        resilient_lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Progress string formatting
// =============================================================================

/// Format a byte count as a human-readable size.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.2} GiB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.2} MiB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a transfer rate as a human-readable speed.
pub fn format_speed(bps: f64) -> String {
    if bps >= 1_073_741_824.0 {
        format!("{:.1} GiB/s", bps / 1_073_741_824.0)
    } else if bps >= 1_048_576.0 {
        format!("{:.1} MiB/s", bps / 1_048_576.0)
    } else if bps >= 1024.0 {
        format!("{:.1} KiB/s", bps / 1024.0)
    } else {
        format!("{:.0} B/s", bps)
    }
}

/// Format a remaining-time estimate.
pub fn format_eta(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_creates_entry() {
        let tracker = DownloadTracker::new();
        tracker.update("d1", TrackerUpdate::status(DownloadStatus::Starting));

        let entry = tracker.get("d1").unwrap();
        assert_eq!(entry.status, DownloadStatus::Starting);
        assert!(entry.speeds.is_empty());
    }

    #[test]
    fn test_update_merges_fields() {
        let tracker = DownloadTracker::new();
        tracker.update("d1", TrackerUpdate::status(DownloadStatus::Downloading));
        tracker.update(
            "d1",
            TrackerUpdate {
                percent: Some("42.0%".into()),
                speed: Some("1.2 MiB/s".into()),
                speed_sample: Some("1.2 MiB/s".into()),
                ..Default::default()
            },
        );
        tracker.update(
            "d1",
            TrackerUpdate {
                eta: Some("30s".into()),
                ..Default::default()
            },
        );

        let entry = tracker.get("d1").unwrap();
        assert_eq!(entry.status, DownloadStatus::Downloading);
        assert_eq!(entry.percent.as_deref(), Some("42.0%"));
        assert_eq!(entry.speed.as_deref(), Some("1.2 MiB/s"));
        assert_eq!(entry.eta.as_deref(), Some("30s"));
        assert_eq!(entry.speeds.len(), 1);
    }

    #[test]
    fn test_speed_samples_are_bounded() {
        let tracker = DownloadTracker::new();
        for i in 0..(MAX_SPEED_SAMPLES + 10) {
            tracker.update(
                "d1",
                TrackerUpdate {
                    speed_sample: Some(format!("{} B/s", i)),
                    ..Default::default()
                },
            );
        }
        let entry = tracker.get("d1").unwrap();
        assert_eq!(entry.speeds.len(), MAX_SPEED_SAMPLES);
        // Oldest samples dropped first
        assert_eq!(entry.speeds.last().map(String::as_str), Some("59 B/s"));
    }

    #[test]
    fn test_summary_is_a_copy() {
        let tracker = DownloadTracker::new();
        tracker.update("d1", TrackerUpdate::status(DownloadStatus::Downloading));

        let mut summary = tracker.summary();
        summary.remove("d1");
        assert!(tracker.get("d1").is_some());
    }

    #[test]
    fn test_cleanup_respects_ttl() {
        let tracker = DownloadTracker::new();
        tracker.update("old", TrackerUpdate::status(DownloadStatus::Finished));
        tracker.update("fresh", TrackerUpdate::status(DownloadStatus::Finished));
        tracker.update("live", TrackerUpdate::status(DownloadStatus::Downloading));

        // Age the "old" entry by hand
        {
            let mut entries = resilient_lock(&tracker.entries);
            entries.get_mut("old").unwrap().last_update =
                Utc::now() - chrono::Duration::seconds(120);
        }

        let removed = tracker.cleanup_finished(Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert!(tracker.get("old").is_none());
        assert!(tracker.get("fresh").is_some());
        assert!(tracker.get("live").is_some());
    }

    #[test]
    fn test_cleanup_never_evicts_active_entries() {
        let tracker = DownloadTracker::new();
        tracker.update("live", TrackerUpdate::status(DownloadStatus::Downloading));
        {
            let mut entries = resilient_lock(&tracker.entries);
            entries.get_mut("live").unwrap().last_update =
                Utc::now() - chrono::Duration::days(1);
        }

        assert_eq!(tracker.cleanup_finished(Duration::from_secs(1)), 0);
        assert!(tracker.get("live").is_some());
    }

    #[test]
    fn test_remove() {
        let tracker = DownloadTracker::new();
        tracker.update("d1", TrackerUpdate::status(DownloadStatus::Finished));
        assert!(tracker.remove("d1"));
        assert!(!tracker.remove("d1"));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2_097_152), "2.00 MiB");
        assert_eq!(format_speed(1536.0), "1.5 KiB/s");
        assert_eq!(format_eta(42), "42s");
        assert_eq!(format_eta(125), "2m 5s");
        assert_eq!(format_eta(7260), "2h 1m");
    }
}
