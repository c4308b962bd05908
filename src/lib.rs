// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! dlserve - Local download orchestration server library
//!
//! A small HTTP server that accepts download requests, queues them,
//! and delegates the actual fetching to external tools (yt-dlp for
//! video, gallery-dl for image galleries), tracking progress and
//! outcomes along the way.
//!
//! # Core Modules
//!
//! - [`queue`] - Persisted FIFO queue, dispatch worker, and manager
//! - [`tracker`] - Unified in-memory download state tracker
//! - [`context`] - Shared orchestration context (handles, signals, history guard)
//! - [`invoke`] - Invocation protocol, retry rules, error classification
//! - [`downloader`] - External tool boundary (yt-dlp / gallery-dl)
//! - [`history`] - Append-only terminal outcome log
//! - [`server`] - HTTP API
//! - [`config`] - Configuration file handling

pub mod config;
pub mod context;
pub mod downloader;
pub mod history;
pub mod invoke;
pub mod queue;
pub mod server;
pub mod sync;
pub mod tracker;

// Re-export the types most callers need
pub use config::Config;
pub use context::DownloadContext;
pub use downloader::{Downloader, ExternalDownloader, InvokeRequest};
pub use history::{HistoryEntry, HistoryLog};
pub use invoke::classify::ErrorInfo;
pub use invoke::handle::ControlHandle;
pub use queue::{Disposition, QueueManager, QueueStore, TaskRecord};
pub use server::Server;
pub use tracker::{DownloadStatus, DownloadTracker};
