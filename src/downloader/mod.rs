// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! External downloader boundary.
//!
//! The actual media fetching is delegated to external tools (yt-dlp for
//! video, gallery-dl for image galleries). This module defines the
//! interface the orchestration core invokes them through; the
//! subprocess implementations live in [`external`].

use std::fmt;
use std::path::PathBuf;

use serde_json::Value;

use crate::config::Config;
use crate::queue::types::TaskRecord;

pub mod external;

pub use external::{ExternalDownloader, GalleryDlDownloader, YtDlpDownloader};

/// Which external tool handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    YtDlp,
    GalleryDl,
}

/// One fully-resolved invocation of an external downloader.
///
/// Built from a [`TaskRecord`]'s options at dispatch time; retry rules
/// may mutate it between attempts (disable resume, narrow the format).
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub download_id: String,
    pub url: String,
    pub tool: Tool,
    pub output_dir: PathBuf,
    pub format: Option<String>,
    pub playlist: bool,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    /// Resume partial files (yt-dlp --continue). Disabled by the
    /// stale-range retry rule.
    pub resume: bool,
    /// Overwrite existing output. Enabled by the stale-range retry rule.
    pub overwrite: bool,
}

impl InvokeRequest {
    /// Resolve a queued task into an invocation, applying config
    /// defaults for anything the caller did not specify.
    pub fn from_task(task: &TaskRecord, config: &Config) -> Self {
        let tool = match task.option_str("tool") {
            Some("gallery-dl") | Some("gallery_dl") => Tool::GalleryDl,
            _ => Tool::YtDlp,
        };
        let output_dir = task
            .option_str("outputDir")
            .map(PathBuf::from)
            .unwrap_or_else(|| config.download_dir.clone());

        Self {
            download_id: task.download_id.clone(),
            url: task.url.clone(),
            tool,
            output_dir,
            format: task.option_str("format").map(str::to_string),
            playlist: task.option_bool("playlist"),
            user_agent: task.option_str("userAgent").map(str::to_string),
            referrer: task.option_str("referrer").map(str::to_string),
            resume: true,
            overwrite: false,
        }
    }
}

/// Raw progress figures reported by a downloader tick. Pre-formatted
/// strings are used when the tool supplied them; otherwise the invoke
/// layer formats the raw counts itself.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub percent: Option<f64>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<f64>,
    pub eta_secs: Option<u64>,
    pub percent_str: Option<String>,
    pub downloaded_str: Option<String>,
    pub total_str: Option<String>,
    pub speed_str: Option<String>,
    pub eta_str: Option<String>,
}

/// Result of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct DownloadOutcome {
    /// Final output artifact, when the tool reported one.
    pub output_path: Option<PathBuf>,
    /// Best-effort metadata (title, file count, ...).
    pub metadata: serde_json::Map<String, Value>,
}

impl DownloadOutcome {
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Failure modes of one invocation attempt.
#[derive(Debug)]
pub enum DownloadError {
    /// The progress callback observed a cancellation request.
    Canceled,
    /// The tool exited unsuccessfully; `message` carries its error text
    /// for classification.
    Tool { message: String },
    /// The tool binary could not be started at all.
    Spawn { tool: String, source: std::io::Error },
    /// The tool reported success but the output artifact was empty
    /// (failed merge leaving a zero-byte stub).
    EmptyOutput { path: PathBuf },
    Io(std::io::Error),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::Canceled => write!(f, "download canceled"),
            DownloadError::Tool { message } => write!(f, "downloader failed: {}", message),
            DownloadError::Spawn { tool, source } => {
                write!(f, "failed to start {}: {}", tool, source)
            }
            DownloadError::EmptyOutput { path } => {
                write!(f, "downloader produced an empty output file: {:?}", path)
            }
            DownloadError::Io(e) => write!(f, "download I/O error: {}", e),
        }
    }
}

impl std::error::Error for DownloadError {}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::Io(e)
    }
}

/// Callbacks a downloader drives while an invocation runs.
pub trait InvokeEvents: Send {
    /// Called once the external process has been spawned. `pid` is
    /// `None` for in-process implementations.
    fn started(&mut self, _pid: Option<u32>) {}

    /// Called on every progress tick. Returning `false` asks the
    /// downloader to stop; it must then terminate the transfer and
    /// return [`DownloadError::Canceled`].
    fn progress(&mut self, update: ProgressUpdate) -> bool;
}

/// The black-box download engine the dispatcher invokes.
///
/// Implementations block until the download finishes; the dispatcher
/// runs them on the blocking thread pool.
pub trait Downloader: Send + Sync {
    fn invoke(
        &self,
        request: &InvokeRequest,
        events: &mut dyn InvokeEvents,
    ) -> Result<DownloadOutcome, DownloadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_task_defaults() {
        let config = Config::default();
        let task = TaskRecord::new("d1", "http://example.com/v");
        let req = InvokeRequest::from_task(&task, &config);

        assert_eq!(req.tool, Tool::YtDlp);
        assert_eq!(req.output_dir, config.download_dir);
        assert!(req.resume);
        assert!(!req.overwrite);
        assert!(!req.playlist);
    }

    #[test]
    fn test_request_from_task_options() {
        let config = Config::default();
        let task = TaskRecord::new("d1", "http://example.com/gallery")
            .with_option("tool", Value::String("gallery-dl".into()))
            .with_option("outputDir", Value::String("/tmp/galleries".into()))
            .with_option("format", Value::String("best".into()))
            .with_option("playlist", Value::Bool(true));
        let req = InvokeRequest::from_task(&task, &config);

        assert_eq!(req.tool, Tool::GalleryDl);
        assert_eq!(req.output_dir, PathBuf::from("/tmp/galleries"));
        assert_eq!(req.format.as_deref(), Some("best"));
        assert!(req.playlist);
    }
}
