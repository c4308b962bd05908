// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Queue manager: the composition root of the download subsystem.
//!
//! Owns the persisted store, the shared context, the downloader, and
//! the background tasks (dispatch worker + periodic tracker sweep),
//! and exposes the operations the HTTP routes call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::context::DownloadContext;
use crate::downloader::Downloader;
use crate::sync::resilient_lock;

use super::store::QueueStore;
use super::types::TaskRecord;
use super::worker::{self, CapacityFn, DispatchWorker};

/// How often terminal tracker entries are swept for TTL eviction.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Where a submitted task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Launched immediately; capacity was available.
    Dispatched,
    /// Parked in the queue for the worker to pick up.
    Queued,
}

pub struct QueueManager {
    store: Arc<QueueStore>,
    ctx: Arc<DownloadContext>,
    downloader: Arc<dyn Downloader>,
    capacity: CapacityFn,
    config: Config,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(
        store: Arc<QueueStore>,
        ctx: Arc<DownloadContext>,
        downloader: Arc<dyn Downloader>,
        capacity: CapacityFn,
        config: Config,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            ctx,
            downloader,
            capacity,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the dispatch worker and the periodic tracker sweep.
    pub fn start(&self) {
        let worker = DispatchWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.ctx),
            Arc::clone(&self.downloader),
            Arc::clone(&self.capacity),
            self.config.clone(),
            self.shutdown.subscribe(),
        );
        let worker_task = tokio::spawn(worker.run());

        let ctx = Arc::clone(&self.ctx);
        let ttl = Duration::from_secs(self.config.finished_ttl_secs);
        let mut shutdown = self.shutdown.subscribe();
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        let removed = ctx.tracker.cleanup_finished(ttl);
                        let pruned = ctx.prune_stale();
                        if removed > 0 || pruned > 0 {
                            tracing::debug!(
                                "Swept {} expired tracker entr(ies), {} stale side entr(ies)",
                                removed,
                                pruned
                            );
                        }
                    }
                }
            }
        });

        let mut tasks = resilient_lock(&self.tasks);
        tasks.push(worker_task);
        tasks.push(sweep_task);
    }

    /// Signal the background tasks to stop. In-flight downloads run to
    /// completion; nothing new is launched.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Submit a new download: launch it right away when capacity
    /// allows, otherwise queue it.
    pub fn submit(&self, task: TaskRecord) -> Disposition {
        let max = (self.capacity)().max(1);
        match worker::try_launch(task, &self.ctx, &self.downloader, &self.config, max) {
            Ok(()) => Disposition::Dispatched,
            Err(task) => {
                self.store.enqueue(task);
                Disposition::Queued
            }
        }
    }

    /// Launch a queued task out of turn.
    ///
    /// Returns false when the id is not in the queue. At capacity
    /// without `override_capacity` the task is moved to the head of the
    /// queue instead, so it launches as soon as a slot frees; with
    /// `override_capacity` it launches immediately regardless of the
    /// limit.
    pub fn force_start(&self, download_id: &str, override_capacity: bool) -> bool {
        let Some(task) = self.store.take(download_id) else {
            return false;
        };

        if override_capacity {
            worker::launch(task, &self.ctx, &self.downloader, &self.config);
            return true;
        }

        let max = (self.capacity)().max(1);
        match worker::try_launch(task, &self.ctx, &self.downloader, &self.config, max) {
            Ok(()) => true,
            Err(task) => {
                tracing::info!(
                    "Force-start of {} deferred: at capacity, moved to queue head",
                    download_id
                );
                self.store.push_front(task);
                true
            }
        }
    }

    pub fn remove(&self, download_id: &str) -> bool {
        self.store.remove(download_id)
    }

    pub fn reorder(&self, new_order: &[String]) {
        self.store.reorder(new_order);
    }

    pub fn list(&self) -> Vec<TaskRecord> {
        self.store.list()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn context(&self) -> &Arc<DownloadContext> {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
