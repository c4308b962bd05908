// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Background dispatch worker.
//!
//! A single long-lived task that moves queued downloads into flight.
//! Each scheduling iteration re-reads the capacity limit, so config
//! edits apply between iterations, and launches head-of-queue tasks
//! until the limit is reached. When nothing can be launched the worker
//! parks on a queue-change notification, bounded by a poll interval so
//! a missed wakeup or freed capacity is noticed within one interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::Config;
use crate::context::DownloadContext;
use crate::downloader::Downloader;
use crate::invoke;
use crate::invoke::handle::CooperativeHandle;

use super::store::QueueStore;
use super::types::TaskRecord;

/// Upper bound on how long the worker sleeps with nothing to launch.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Live capacity limit, re-evaluated every scheduling iteration.
pub type CapacityFn = Arc<dyn Fn() -> usize + Send + Sync>;

pub struct DispatchWorker {
    store: Arc<QueueStore>,
    ctx: Arc<DownloadContext>,
    downloader: Arc<dyn Downloader>,
    capacity: CapacityFn,
    config: Config,
    shutdown: watch::Receiver<bool>,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<QueueStore>,
        ctx: Arc<DownloadContext>,
        downloader: Arc<dyn Downloader>,
        capacity: CapacityFn,
        config: Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            ctx,
            downloader,
            capacity,
            config,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Dispatch worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let max = (self.capacity)().max(1);
            let mut launched = 0usize;
            // try_launch claims a slot atomically, so a route-layer
            // submit racing this loop can never push the in-flight
            // count past the limit. A task that loses the race goes
            // back to the head of the queue unharmed.
            while self.ctx.in_flight() < max {
                let Some(task) = self.store.pop_front() else {
                    break;
                };
                match try_launch(task, &self.ctx, &self.downloader, &self.config, max) {
                    Ok(()) => launched += 1,
                    Err(task) => {
                        self.store.push_front(task);
                        break;
                    }
                }
            }

            if launched == 0 {
                tokio::select! {
                    _ = self.shutdown.changed() => {}
                    _ = tokio::time::timeout(POLL_INTERVAL, self.store.changed()) => {}
                }
            }
        }
        tracing::info!("Dispatch worker stopped");
    }
}

/// Put a task in flight: register its control handle, then spawn the
/// dispatch. Registration happens before the spawn so cancel/pause can
/// reach the download immediately and capacity checks see it.
pub(crate) fn launch(
    task: TaskRecord,
    ctx: &Arc<DownloadContext>,
    downloader: &Arc<dyn Downloader>,
    config: &Config,
) {
    let handle = CooperativeHandle::new(&task.download_id, ctx.signals());
    ctx.register_handle(&task.download_id, Arc::new(handle));
    tokio::spawn(invoke::dispatch(
        task,
        Arc::clone(ctx),
        Arc::clone(downloader),
        config.clone(),
    ));
}

/// Like [`launch`], but only while a slot is free under `max`. The
/// capacity check and the handle registration are one atomic step on
/// the registry, so concurrent callers cannot all pass a stale
/// capacity read. Hands the task back when no slot was free.
pub(crate) fn try_launch(
    task: TaskRecord,
    ctx: &Arc<DownloadContext>,
    downloader: &Arc<dyn Downloader>,
    config: &Config,
    max: usize,
) -> Result<(), TaskRecord> {
    let handle = CooperativeHandle::new(&task.download_id, ctx.signals());
    if !ctx.try_register_within(&task.download_id, Arc::new(handle), max) {
        return Err(task);
    }
    tokio::spawn(invoke::dispatch(
        task,
        Arc::clone(ctx),
        Arc::clone(downloader),
        config.clone(),
    ));
    Ok(())
}
