// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Orchestration context.
//!
//! One `DownloadContext` is constructed at process start and shared by
//! the route layer, the dispatch worker, and the invocation boundary.
//! It owns every piece of cross-cutting download state: the unified
//! tracker, the control-handle registry, the cancellation/pause signal
//! sets, the error side-table, the history sink, and the guard set
//! that keeps history writes exactly-once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::history::{HistoryEntry, HistoryLog};
use crate::invoke::classify::ErrorInfo;
use crate::invoke::handle::ControlHandle;
use crate::sync::resilient_lock;
use crate::tracker::DownloadTracker;

/// Cancellation and pause request sets, shared with control handles.
///
/// Both are consulted by the invocation's progress callback on every
/// tick; individual add/discard operations are atomic but a cancel and
/// a pause issued in the same instant may land in either order.
#[derive(Default)]
pub struct SignalSets {
    cancel: Mutex<HashSet<String>>,
    pause: Mutex<HashSet<String>>,
}

impl SignalSets {
    pub fn request_cancel(&self, id: &str) {
        resilient_lock(&self.cancel).insert(id.to_string());
    }

    /// Check for a cancel request and clear it if present.
    pub fn take_cancel(&self, id: &str) -> bool {
        resilient_lock(&self.cancel).remove(id)
    }

    pub fn request_pause(&self, id: &str) {
        resilient_lock(&self.pause).insert(id.to_string());
    }

    pub fn clear_pause(&self, id: &str) {
        resilient_lock(&self.pause).remove(id);
    }

    pub fn is_paused(&self, id: &str) -> bool {
        resilient_lock(&self.pause).contains(id)
    }

    /// Drop any leftover signals for a finished download.
    pub fn clear(&self, id: &str) {
        resilient_lock(&self.cancel).remove(id);
        resilient_lock(&self.pause).remove(id);
    }
}

/// Shared state for every in-flight and recently-finished download.
pub struct DownloadContext {
    pub tracker: DownloadTracker,
    signals: Arc<SignalSets>,
    registry: Mutex<HashMap<String, Arc<dyn ControlHandle>>>,
    error_table: Mutex<HashMap<String, ErrorInfo>>,
    recorded: Mutex<HashSet<String>>,
    history: HistoryLog,
}

impl DownloadContext {
    pub fn new(history: HistoryLog) -> Self {
        Self {
            tracker: DownloadTracker::new(),
            signals: Arc::new(SignalSets::default()),
            registry: Mutex::new(HashMap::new()),
            error_table: Mutex::new(HashMap::new()),
            recorded: Mutex::new(HashSet::new()),
            history,
        }
    }

    pub fn signals(&self) -> Arc<SignalSets> {
        Arc::clone(&self.signals)
    }

    // -------------------------------------------------------------------------
    // Control handle registry
    // -------------------------------------------------------------------------

    /// Register (or replace) the control handle for a download.
    /// Last writer wins when a duplicate id dispatches twice.
    pub fn register_handle(&self, id: &str, handle: Arc<dyn ControlHandle>) {
        resilient_lock(&self.registry).insert(id.to_string(), handle);
    }

    /// Register the control handle only while fewer than `max`
    /// downloads are in flight. The capacity check and the insert
    /// happen under the registry lock, so two concurrent callers can
    /// never both claim the last slot. Returns whether the handle was
    /// registered.
    pub fn try_register_within(
        &self,
        id: &str,
        handle: Arc<dyn ControlHandle>,
        max: usize,
    ) -> bool {
        let mut registry = resilient_lock(&self.registry);
        if registry.len() >= max {
            return false;
        }
        registry.insert(id.to_string(), handle);
        true
    }

    pub fn remove_handle(&self, id: &str) {
        resilient_lock(&self.registry).remove(id);
    }

    pub fn handle(&self, id: &str) -> Option<Arc<dyn ControlHandle>> {
        resilient_lock(&self.registry).get(id).cloned()
    }

    /// Number of downloads currently dispatched; this is the live
    /// figure the capacity policy checks.
    pub fn in_flight(&self) -> usize {
        resilient_lock(&self.registry).len()
    }

    // -------------------------------------------------------------------------
    // Error side-table
    // -------------------------------------------------------------------------

    /// Record classification for a failed download so the status API
    /// can attach troubleshooting text even before (or after) the
    /// tracker entry exists.
    pub fn record_error(&self, id: &str, info: ErrorInfo) {
        resilient_lock(&self.error_table).insert(id.to_string(), info);
    }

    pub fn error_info(&self, id: &str) -> Option<ErrorInfo> {
        resilient_lock(&self.error_table).get(id).cloned()
    }

    pub fn clear_error(&self, id: &str) {
        resilient_lock(&self.error_table).remove(id);
    }

    /// Drop side-table and history-guard entries for downloads that
    /// are neither tracked nor in flight. Runs with the periodic
    /// tracker sweep so both maps stay bounded by the tracker's TTL
    /// instead of growing for the life of the process. Returns the
    /// number of entries dropped.
    pub fn prune_stale(&self) -> usize {
        let mut live = self.tracker.ids();
        for id in resilient_lock(&self.registry).keys() {
            live.insert(id.clone());
        }

        let mut pruned = 0;
        {
            let mut table = resilient_lock(&self.error_table);
            let before = table.len();
            table.retain(|id, _| live.contains(id));
            pruned += before - table.len();
        }
        {
            let mut recorded = resilient_lock(&self.recorded);
            let before = recorded.len();
            recorded.retain(|id| live.contains(id));
            pruned += before - recorded.len();
        }
        pruned
    }

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    /// Write the terminal history record for a download, at most once.
    /// Both the callback finish path and the post-invocation fallback
    /// path call this; only the first wins.
    pub fn record_history_once(&self, entry: HistoryEntry) {
        let first = resilient_lock(&self.recorded).insert(entry.download_id.clone());
        if first {
            self.history.append(&entry);
        } else {
            tracing::debug!(
                "History for {} already recorded, skipping duplicate write",
                entry.download_id
            );
        }
    }

    /// Forget the exactly-once guard for an id, so a re-submitted
    /// download can record history again.
    pub fn reset_history_guard(&self, id: &str) {
        resilient_lock(&self.recorded).remove(id);
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Idempotent terminal cleanup: runs on every exit path of a
    /// dispatch, including failures.
    pub fn finish_dispatch(&self, id: &str) {
        self.remove_handle(id);
        self.signals.clear(id);
    }
}
