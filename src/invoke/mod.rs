// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Invocation boundary.
//!
//! [`dispatch`] drives one download from "picked for launch" to a
//! terminal state: it publishes tracker updates from the downloader's
//! progress callbacks, applies the retry rules on failure, classifies
//! terminal errors, records history exactly once, and always clears
//! the control handle and signals on the way out.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::config::Config;
use crate::context::{DownloadContext, SignalSets};
use crate::downloader::{
    DownloadError, DownloadOutcome, Downloader, InvokeEvents, InvokeRequest, ProgressUpdate,
};
use crate::history::HistoryEntry;
use crate::tracker::{
    format_bytes, format_eta, format_speed, DownloadStatus, ProgressSnapshot, TrackerUpdate,
};

pub mod classify;
pub mod handle;
pub mod retry;

use handle::{CooperativeHandle, ProcessHandle};

/// Speed samples averaged for the recomputed ETA.
const RECENT_SPEED_WINDOW: usize = 10;

/// Run one download to completion.
///
/// The caller has already registered a control handle for the task, so
/// cancel/pause requests can arrive from the moment this future is
/// spawned. Every exit path ends in [`DownloadContext::finish_dispatch`].
pub async fn dispatch(
    task: crate::queue::types::TaskRecord,
    ctx: Arc<DownloadContext>,
    downloader: Arc<dyn Downloader>,
    config: Config,
) {
    let id = task.download_id.clone();
    tracing::info!("Dispatching download {} ({})", id, task.url);

    // A re-submitted id starts a fresh lifecycle: old classification and
    // the history guard from the previous run no longer apply.
    ctx.clear_error(&id);
    ctx.reset_history_guard(&id);
    ctx.tracker
        .update(&id, TrackerUpdate::status(DownloadStatus::Starting));

    let mut request = InvokeRequest::from_task(&task, &config);
    let rules = retry::standard_rules();
    let mut used_rules: HashSet<&'static str> = HashSet::new();
    let mut events = DispatchEvents::new(&id, Arc::clone(&ctx));

    let result = loop {
        let attempt_downloader = Arc::clone(&downloader);
        let attempt_request = request.clone();
        let mut attempt_events = events;
        let joined = tokio::task::spawn_blocking(move || {
            let result = attempt_downloader.invoke(&attempt_request, &mut attempt_events);
            (result, attempt_events)
        })
        .await;

        let attempt = match joined {
            Ok((result, returned_events)) => {
                events = returned_events;
                result.and_then(check_output_not_empty)
            }
            Err(e) => {
                tracing::error!("Downloader task for {} panicked: {}", id, e);
                events = DispatchEvents::new(&id, Arc::clone(&ctx));
                Err(DownloadError::Tool {
                    message: format!("downloader task panicked: {}", e),
                })
            }
        };

        match attempt {
            Ok(outcome) => break Ok(outcome),
            Err(DownloadError::Canceled) => break Err(DownloadError::Canceled),
            Err(error) => {
                let rule = rules
                    .iter()
                    .find(|r| r.applies(&error) && !used_rules.contains(r.name));
                match rule {
                    Some(rule) => {
                        used_rules.insert(rule.name);
                        let backoff = retry::backoff_for(rule, &error);
                        tracing::info!(
                            "Retrying {} via {} rule after {:?}: {}",
                            id,
                            rule.name,
                            backoff,
                            error
                        );
                        rule.apply(&error, &mut request);
                        // The failed attempt's process is gone; drop
                        // back to the cooperative handle so control
                        // requests during the backoff cannot signal a
                        // dead (or reused) pid.
                        ctx.register_handle(
                            &id,
                            Arc::new(CooperativeHandle::new(&id, ctx.signals())),
                        );
                        if !backoff.is_zero() {
                            tokio::time::sleep(backoff).await;
                        }
                    }
                    None => break Err(error),
                }
            }
        }
    };

    match result {
        Ok(outcome) => {
            tracing::info!("Download {} finished", id);
            ctx.tracker.update(
                &id,
                TrackerUpdate {
                    status: Some(DownloadStatus::Finished),
                    percent: Some("100%".to_string()),
                    metadata: Some(outcome.metadata),
                    ..Default::default()
                },
            );
            ctx.record_history_once(HistoryEntry::new(&id, &task.url, "finished"));
        }
        Err(DownloadError::Canceled) => {
            tracing::info!("Download {} canceled", id);
            ctx.tracker
                .update(&id, TrackerUpdate::status(DownloadStatus::Canceled));
            ctx.record_history_once(HistoryEntry::new(&id, &task.url, "canceled"));
        }
        Err(error) => {
            let info = classify::classify(&raw_message(&error));
            tracing::error!("Download {} failed ({}): {}", id, info.code, info.message);
            ctx.tracker.update(
                &id,
                TrackerUpdate {
                    status: Some(DownloadStatus::Error),
                    error: Some(info.message.clone()),
                    ..Default::default()
                },
            );
            ctx.record_history_once(
                HistoryEntry::new(&id, &task.url, "error").with_error(info.code, &info.message),
            );
            ctx.record_error(&id, info);
        }
    }

    ctx.finish_dispatch(&id);
}

/// The text fed to error classification: the tool's own output when we
/// have it, otherwise the error's rendering.
fn raw_message(error: &DownloadError) -> String {
    match error {
        DownloadError::Tool { message } => message.clone(),
        other => other.to_string(),
    }
}

/// A run that "succeeded" but left a zero-byte artifact is a failed
/// merge in disguise; surface it as an error so the retry rules see it.
fn check_output_not_empty(outcome: DownloadOutcome) -> Result<DownloadOutcome, DownloadError> {
    if let Some(path) = &outcome.output_path {
        if std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false) {
            return Err(DownloadError::EmptyOutput {
                path: PathBuf::from(path),
            });
        }
    }
    Ok(outcome)
}

/// Bridges the blocking downloader's callbacks to the shared tracker
/// and signal sets.
struct DispatchEvents {
    id: String,
    ctx: Arc<DownloadContext>,
    signals: Arc<SignalSets>,
    recent_speeds: VecDeque<f64>,
}

impl DispatchEvents {
    fn new(id: &str, ctx: Arc<DownloadContext>) -> Self {
        let signals = ctx.signals();
        Self {
            id: id.to_string(),
            ctx,
            signals,
            recent_speeds: VecDeque::with_capacity(RECENT_SPEED_WINDOW),
        }
    }

    /// ETA from the rolling average of recent speeds, which is steadier
    /// than the tool's instantaneous figure.
    fn improved_eta(&mut self, update: &ProgressUpdate) -> Option<String> {
        if let Some(bps) = update.speed_bps {
            self.recent_speeds.push_back(bps);
            if self.recent_speeds.len() > RECENT_SPEED_WINDOW {
                self.recent_speeds.pop_front();
            }
        }
        let total = update.total_bytes?;
        let downloaded = update.downloaded_bytes?;
        if self.recent_speeds.is_empty() {
            return None;
        }
        let avg = self.recent_speeds.iter().sum::<f64>() / self.recent_speeds.len() as f64;
        if avg <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(downloaded);
        Some(format_eta((remaining as f64 / avg) as u64))
    }
}

impl InvokeEvents for DispatchEvents {
    fn started(&mut self, pid: Option<u32>) {
        if let Some(pid) = pid {
            // Upgrade from the cooperative handle registered at launch:
            // suspend/resume can now reach the process itself.
            let handle = ProcessHandle::new(&self.id, pid, Arc::clone(&self.signals));
            self.ctx.register_handle(&self.id, Arc::new(handle));
            tracing::debug!("Download {} running as pid {}", self.id, pid);
        }
    }

    fn progress(&mut self, update: ProgressUpdate) -> bool {
        if self.signals.take_cancel(&self.id) {
            return false;
        }
        // Paused: the transfer keeps running but observable progress
        // stays frozen at the pre-pause values.
        if self.signals.is_paused(&self.id) {
            return true;
        }

        let percent = update
            .percent_str
            .clone()
            .or_else(|| update.percent.map(|p| format!("{:.1}%", p)));
        let downloaded = update
            .downloaded_str
            .clone()
            .or_else(|| update.downloaded_bytes.map(format_bytes));
        let total = update
            .total_str
            .clone()
            .or_else(|| update.total_bytes.map(format_bytes));
        let speed = update
            .speed_str
            .clone()
            .or_else(|| update.speed_bps.map(format_speed));
        let eta = update
            .eta_str
            .clone()
            .or_else(|| update.eta_secs.map(format_eta));
        let improved_eta = self.improved_eta(&update);

        let snapshot = ProgressSnapshot {
            timestamp: Utc::now(),
            percent: percent.clone(),
            downloaded: downloaded.clone(),
            total: total.clone(),
            speed: speed.clone(),
            eta: eta.clone(),
        };

        self.ctx.tracker.update(
            &self.id,
            TrackerUpdate {
                status: Some(DownloadStatus::Downloading),
                percent,
                downloaded,
                total,
                speed: speed.clone(),
                eta,
                improved_eta,
                speed_sample: speed,
                snapshot: Some(snapshot),
                ..Default::default()
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryLog;
    use crate::invoke::handle::ControlHandle;
    use crate::queue::types::TaskRecord;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Scripted downloader: one queued result per attempt, recording
    /// the requests it was invoked with.
    struct StubDownloader {
        script: Mutex<VecDeque<Result<DownloadOutcome, DownloadError>>>,
        requests: Mutex<Vec<InvokeRequest>>,
    }

    impl StubDownloader {
        fn new(script: Vec<Result<DownloadOutcome, DownloadError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl Downloader for StubDownloader {
        fn invoke(
            &self,
            request: &InvokeRequest,
            events: &mut dyn InvokeEvents,
        ) -> Result<DownloadOutcome, DownloadError> {
            self.requests.lock().unwrap().push(request.clone());
            events.started(None);
            let update = ProgressUpdate {
                percent: Some(50.0),
                downloaded_bytes: Some(500),
                total_bytes: Some(1000),
                speed_bps: Some(100.0),
                ..Default::default()
            };
            if !events.progress(update) {
                return Err(DownloadError::Canceled);
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(DownloadOutcome::default()))
        }
    }

    fn context_in(dir: &TempDir) -> Arc<DownloadContext> {
        Arc::new(DownloadContext::new(HistoryLog::new(
            dir.path().join("history.jsonl"),
        )))
    }

    fn config_in(dir: &TempDir) -> Config {
        Config {
            download_dir: dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_successful_dispatch() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);
        let downloader = Arc::new(StubDownloader::new(vec![Ok(DownloadOutcome::default())]));
        let task = TaskRecord::new("d1", "http://x/1");

        dispatch(task, Arc::clone(&ctx), downloader.clone(), config_in(&dir)).await;

        let entry = ctx.tracker.get("d1").unwrap();
        assert_eq!(entry.status, DownloadStatus::Finished);
        assert_eq!(entry.percent.as_deref(), Some("100%"));
        assert_eq!(downloader.attempts(), 1);
        assert_eq!(ctx.in_flight(), 0);

        let history = ctx.history().read_all();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "finished");
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);
        let downloader = Arc::new(StubDownloader::new(vec![
            Err(DownloadError::Tool {
                message: "connection reset by peer".into(),
            }),
            Ok(DownloadOutcome::default()),
        ]));
        let task = TaskRecord::new("d1", "http://x/1");

        dispatch(task, Arc::clone(&ctx), downloader.clone(), config_in(&dir)).await;

        assert_eq!(downloader.attempts(), 2);
        assert_eq!(
            ctx.tracker.get("d1").unwrap().status,
            DownloadStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_repeated_transient_failure_is_terminal() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);
        let downloader = Arc::new(StubDownloader::new(vec![
            Err(DownloadError::Tool {
                message: "connection reset by peer".into(),
            }),
            Err(DownloadError::Tool {
                message: "connection reset by peer".into(),
            }),
        ]));
        let task = TaskRecord::new("d1", "http://x/1");

        dispatch(task, Arc::clone(&ctx), downloader.clone(), config_in(&dir)).await;

        // The transient rule fires once; the second identical failure
        // is terminal.
        assert_eq!(downloader.attempts(), 2);
        let entry = ctx.tracker.get("d1").unwrap();
        assert_eq!(entry.status, DownloadStatus::Error);
        assert_eq!(ctx.error_info("d1").unwrap().code, "network");

        let history = ctx.history().read_all();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "error");
        assert_eq!(history[0].code.as_deref(), Some("network"));
    }

    #[tokio::test]
    async fn test_stale_range_retries_without_resume() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);
        let downloader = Arc::new(StubDownloader::new(vec![
            Err(DownloadError::Tool {
                message: "HTTP Error 416: Requested Range Not Satisfiable".into(),
            }),
            Ok(DownloadOutcome::default()),
        ]));
        let task = TaskRecord::new("d1", "http://x/1");

        dispatch(task, Arc::clone(&ctx), downloader.clone(), config_in(&dir)).await;

        let requests = downloader.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].resume);
        assert!(!requests[1].resume);
        assert!(requests[1].overwrite);
    }

    #[tokio::test]
    async fn test_zero_byte_output_triggers_format_fallback() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);
        let stub_file = dir.path().join("video.mp4");
        std::fs::write(&stub_file, b"").unwrap();

        let downloader = Arc::new(StubDownloader::new(vec![
            Ok(DownloadOutcome {
                output_path: Some(stub_file.clone()),
                ..Default::default()
            }),
            Ok(DownloadOutcome::default()),
        ]));
        let task = TaskRecord::new("d1", "http://x/1");

        dispatch(task, Arc::clone(&ctx), downloader.clone(), config_in(&dir)).await;

        let requests = downloader.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].format.as_deref().unwrap().contains("best["));
        assert!(!stub_file.exists());
        assert_eq!(
            ctx.tracker.get("d1").unwrap().status,
            DownloadStatus::Finished
        );
    }

    /// Emits three progress ticks, pausing via its control handle
    /// before the second and resuming before the third, recording the
    /// tracker's percent after each tick.
    struct PausingDownloader {
        ctx: Arc<DownloadContext>,
        observed: Mutex<Vec<Option<String>>>,
    }

    impl PausingDownloader {
        fn observe(&self, id: &str) {
            self.observed
                .lock()
                .unwrap()
                .push(self.ctx.tracker.get(id).and_then(|e| e.percent));
        }
    }

    impl Downloader for PausingDownloader {
        fn invoke(
            &self,
            request: &InvokeRequest,
            events: &mut dyn InvokeEvents,
        ) -> Result<DownloadOutcome, DownloadError> {
            let id = request.download_id.clone();
            let handle = CooperativeHandle::new(&id, self.ctx.signals());
            events.started(None);

            let tick = |events: &mut dyn InvokeEvents, percent: f64| {
                events.progress(ProgressUpdate {
                    percent: Some(percent),
                    ..Default::default()
                })
            };

            assert!(tick(events, 10.0));
            self.observe(&id);

            handle.suspend();
            assert!(tick(events, 55.0), "a paused download keeps running");
            self.observe(&id);

            handle.resume();
            assert!(tick(events, 90.0));
            self.observe(&id);

            Ok(DownloadOutcome::default())
        }
    }

    #[tokio::test]
    async fn test_pause_freezes_progress_until_resumed() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);
        let downloader = Arc::new(PausingDownloader {
            ctx: Arc::clone(&ctx),
            observed: Mutex::new(Vec::new()),
        });
        let task = TaskRecord::new("d1", "http://x/1");

        dispatch(task, Arc::clone(&ctx), downloader.clone(), config_in(&dir)).await;

        let observed = downloader.observed.lock().unwrap();
        assert_eq!(
            *observed,
            [
                Some("10.0%".to_string()),
                // Frozen at the pre-pause value through the 55% tick
                Some("10.0%".to_string()),
                Some("90.0%".to_string()),
            ]
        );
        assert!(!ctx.signals().is_paused("d1"));
        assert_eq!(
            ctx.tracker.get("d1").unwrap().status,
            DownloadStatus::Finished
        );
    }

    /// First attempt reports a backing pid and fails transiently; the
    /// retry succeeds.
    struct PidThenFailDownloader {
        attempts: AtomicUsize,
    }

    impl Downloader for PidThenFailDownloader {
        fn invoke(
            &self,
            _request: &InvokeRequest,
            events: &mut dyn InvokeEvents,
        ) -> Result<DownloadOutcome, DownloadError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                events.started(Some(4242));
                Err(DownloadError::Tool {
                    message: "connection reset by peer".into(),
                })
            } else {
                events.started(None);
                Ok(DownloadOutcome::default())
            }
        }
    }

    #[tokio::test]
    async fn test_failed_attempt_downgrades_process_handle() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);
        let downloader = Arc::new(PidThenFailDownloader {
            attempts: AtomicUsize::new(0),
        });
        let task = TaskRecord::new("d1", "http://x/1");

        let running = tokio::spawn(dispatch(
            task,
            Arc::clone(&ctx),
            downloader.clone() as Arc<dyn Downloader>,
            config_in(&dir),
        ));

        // The first attempt fails immediately; the network-class
        // backoff then holds the retry open long enough to inspect
        // the registered handle.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while downloader.attempts.load(Ordering::SeqCst) < 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "first attempt never ran"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let handle = ctx
            .handle("d1")
            .expect("handle stays registered through the backoff");
        assert_eq!(handle.pid(), None, "dead pid must not survive the backoff");

        running.await.unwrap();
        assert_eq!(
            ctx.tracker.get("d1").unwrap().status,
            DownloadStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_cancel_request_ends_in_canceled() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);
        let downloader = Arc::new(StubDownloader::new(vec![]));
        let task = TaskRecord::new("d1", "http://x/1");

        // Cancel before the first progress tick is observed.
        ctx.signals().request_cancel("d1");
        dispatch(task, Arc::clone(&ctx), downloader.clone(), config_in(&dir)).await;

        let entry = ctx.tracker.get("d1").unwrap();
        assert_eq!(entry.status, DownloadStatus::Canceled);
        assert_eq!(downloader.attempts(), 1);

        let history = ctx.history().read_all();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "canceled");
    }

    #[tokio::test]
    async fn test_progress_published_to_tracker() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);
        let downloader = Arc::new(StubDownloader::new(vec![Ok(DownloadOutcome::default())]));
        let task = TaskRecord::new("d1", "http://x/1");

        dispatch(task, Arc::clone(&ctx), downloader, config_in(&dir)).await;

        let entry = ctx.tracker.get("d1").unwrap();
        assert_eq!(entry.downloaded.as_deref(), Some("500 B"));
        assert_eq!(entry.total.as_deref(), Some("1000 B"));
        assert_eq!(entry.speeds.len(), 1);
        assert_eq!(entry.history.len(), 1);
        // 500 bytes remaining at 100 B/s
        assert_eq!(entry.improved_eta.as_deref(), Some("5s"));
    }
}
