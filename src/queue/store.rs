// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Persistent FIFO store for queued download tasks.
//!
//! The queue is held in memory as an ordered vector and mirrored to a
//! JSON array on disk after every mutation, so tasks submitted but not
//! yet dispatched survive a restart. The snapshot is rewritten wholly
//! (temp file + atomic rename) under an exclusive file lock; a corrupt
//! or unreadable snapshot is treated as an empty queue.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::sync::Notify;

use crate::sync::resilient_lock;
use super::types::TaskRecord;

/// Ordered, persisted collection of pending tasks.
pub struct QueueStore {
    tasks: Mutex<Vec<TaskRecord>>,
    path: PathBuf,
    notify: Notify,
}

impl QueueStore {
    /// Open the store, restoring any queued entries from the snapshot.
    ///
    /// A missing, corrupt or unreadable snapshot yields an empty queue;
    /// queue state is best-effort and must never stop the server.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let tasks = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<TaskRecord>>(&content) {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::warn!("Queue snapshot {:?} is corrupt, starting empty: {}", path, e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read queue snapshot {:?}, starting empty: {}", path, e);
                Vec::new()
            }
        };

        if !tasks.is_empty() {
            tracing::info!("Restored {} queued download(s) from {:?}", tasks.len(), path);
        }

        Self {
            tasks: Mutex::new(tasks),
            path,
            notify: Notify::new(),
        }
    }

    /// Append a task to the back of the queue.
    ///
    /// No uniqueness check: a duplicate id creates a second entry.
    pub fn enqueue(&self, task: TaskRecord) {
        let mut tasks = resilient_lock(&self.tasks);
        tasks.push(task);
        self.persist(&tasks);
        drop(tasks);
        self.notify.notify_waiters();
    }

    /// Put a task back at the front of the queue (deferred force-start).
    pub fn push_front(&self, task: TaskRecord) {
        let mut tasks = resilient_lock(&self.tasks);
        tasks.insert(0, task);
        self.persist(&tasks);
        drop(tasks);
        self.notify.notify_waiters();
    }

    /// Remove the first entry with the given id. Returns whether
    /// anything was removed.
    pub fn remove(&self, download_id: &str) -> bool {
        let mut tasks = resilient_lock(&self.tasks);
        let before = tasks.len();
        if let Some(pos) = tasks.iter().position(|t| t.download_id == download_id) {
            tasks.remove(pos);
        }
        let removed = tasks.len() != before;
        if removed {
            self.persist(&tasks);
        }
        drop(tasks);
        if removed {
            self.notify.notify_waiters();
        }
        removed
    }

    /// Take the first entry with the given id out of the queue.
    pub fn take(&self, download_id: &str) -> Option<TaskRecord> {
        let mut tasks = resilient_lock(&self.tasks);
        let pos = tasks.iter().position(|t| t.download_id == download_id)?;
        let task = tasks.remove(pos);
        self.persist(&tasks);
        drop(tasks);
        self.notify.notify_waiters();
        Some(task)
    }

    /// Pop the head of the queue.
    pub fn pop_front(&self) -> Option<TaskRecord> {
        let mut tasks = resilient_lock(&self.tasks);
        if tasks.is_empty() {
            return None;
        }
        let task = tasks.remove(0);
        self.persist(&tasks);
        Some(task)
    }

    /// Re-sequence the queue to match `new_order`.
    ///
    /// Ids present in both the store and `new_order` are placed first,
    /// in the order given; entries absent from `new_order` keep their
    /// relative order and are appended afterward. Unknown ids in
    /// `new_order` are ignored.
    pub fn reorder(&self, new_order: &[String]) {
        let mut tasks = resilient_lock(&self.tasks);
        let mut remaining = std::mem::take(&mut *tasks);
        let mut reordered = Vec::with_capacity(remaining.len());

        for id in new_order {
            if let Some(pos) = remaining.iter().position(|t| &t.download_id == id) {
                reordered.push(remaining.remove(pos));
            }
        }
        reordered.append(&mut remaining);

        *tasks = reordered;
        self.persist(&tasks);
        drop(tasks);
        self.notify.notify_waiters();
    }

    /// Snapshot of the queued tasks, for read-only reporting.
    pub fn list(&self) -> Vec<TaskRecord> {
        resilient_lock(&self.tasks).clone()
    }

    /// Empty the queue and persist an empty snapshot.
    pub fn clear(&self) {
        let mut tasks = resilient_lock(&self.tasks);
        tasks.clear();
        self.persist(&tasks);
    }

    pub fn len(&self) -> usize {
        resilient_lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the queue is mutated.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    /// Rewrite the snapshot file while the in-memory lock is held, so
    /// disk order always matches memory order. Persistence failures are
    /// logged, never raised: losing durability must not lose the queue.
    fn persist(&self, tasks: &[TaskRecord]) {
        if let Err(e) = self.write_snapshot(tasks) {
            tracing::warn!("Failed to persist queue snapshot: {:#}", e);
        }
    }

    fn write_snapshot(&self, tasks: &[TaskRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {:?}", parent))?;
            }
        }

        // Exclusive lock on a sidecar file, held across write + rename,
        // so a second server instance cannot interleave a write.
        let lock_path = self.path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;
        lock_file
            .lock_exclusive()
            .with_context(|| "Failed to lock queue snapshot for writing")?;

        let content = serde_json::to_string_pretty(tasks)
            .with_context(|| "Failed to serialize queue")?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write queue snapshot")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync queue snapshot")?;
        }

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename snapshot into place: {:?}", self.path))?;

        // Lock released when lock_file drops.
        Ok(())
    }
}
