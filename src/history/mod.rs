// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Append-only download history.
//!
//! One JSON object per line, appended after a download reaches a
//! terminal state. Writes are fire-and-forget: a history failure is
//! logged but never aborts the dispatch that produced it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal outcome record for one download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "downloadId", alias = "download_id")]
    pub download_id: String,
    pub url: String,
    /// `finished`, `error`, or `canceled`.
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl HistoryEntry {
    pub fn new(download_id: &str, url: &str, status: &str) -> Self {
        Self {
            download_id: download_id.to_string(),
            url: url.to_string(),
            status: status.to_string(),
            timestamp: Utc::now(),
            error: None,
            code: None,
        }
    }

    pub fn with_error(mut self, code: &str, message: &str) -> Self {
        self.code = Some(code.to_string());
        self.error = Some(message.to_string());
        self
    }
}

/// File-backed history sink.
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Append one entry. Failures are logged and swallowed.
    pub fn append(&self, entry: &HistoryEntry) {
        if let Err(e) = self.try_append(entry) {
            tracing::warn!("Failed to append history entry for {}: {}", entry.download_id, e);
        }
    }

    fn try_append(&self, entry: &HistoryEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }

    /// All recorded entries, oldest first. Unparseable lines are
    /// skipped rather than failing the whole read.
    pub fn read_all(&self) -> Vec<HistoryEntry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}
