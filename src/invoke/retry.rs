// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Retry policy for failed invocation attempts.
//!
//! Every recovery path here has the same shape: inspect the failure,
//! optionally clean artifacts, mutate the request, and try once more.
//! Rules are evaluated in order after each failed attempt; each rule
//! fires at most once per dispatch.

use std::time::Duration;

use crate::downloader::{DownloadError, InvokeRequest};

use super::classify;

/// One recovery rule: predicate over the failure, a pre-retry artifact
/// cleanup step, and a request transform.
pub struct RetryRule {
    pub name: &'static str,
    pub backoff: Duration,
    matches: fn(&DownloadError) -> bool,
    prepare: fn(&DownloadError, &InvokeRequest),
    transform: fn(&mut InvokeRequest),
}

impl RetryRule {
    pub fn applies(&self, error: &DownloadError) -> bool {
        (self.matches)(error)
    }

    /// Run artifact cleanup and mutate the request for the retry.
    pub fn apply(&self, error: &DownloadError, request: &mut InvokeRequest) {
        (self.prepare)(error, request);
        (self.transform)(request);
    }
}

fn no_prepare(_: &DownloadError, _: &InvokeRequest) {}

fn no_transform(_: &mut InvokeRequest) {}

fn tool_message(error: &DownloadError) -> Option<&str> {
    match error {
        DownloadError::Tool { message } => Some(message),
        _ => None,
    }
}

/// The standard rule set, in evaluation order.
pub fn standard_rules() -> Vec<RetryRule> {
    vec![
        // Stale partial file (HTTP 416): drop partial artifacts and
        // restart the transfer from scratch.
        RetryRule {
            name: "stale_range",
            backoff: Duration::ZERO,
            matches: |e| tool_message(e).is_some_and(classify::is_stale_range),
            prepare: |_, request| clean_partial_artifacts(request),
            transform: |request| {
                request.resume = false;
                request.overwrite = true;
            },
        },
        // Transient remote failures: fixed backoff, same options.
        RetryRule {
            name: "transient",
            backoff: Duration::ZERO, // actual backoff comes from the failure class
            matches: |e| {
                tool_message(e).is_some_and(|m| classify::transient_backoff(m).is_some())
            },
            prepare: no_prepare,
            transform: no_transform,
        },
        // Zero-byte output after an apparently successful run: a failed
        // merge left a stub. Delete it and retry with a single-stream
        // format that needs no merge.
        RetryRule {
            name: "empty_output",
            backoff: Duration::ZERO,
            matches: |e| matches!(e, DownloadError::EmptyOutput { .. }),
            prepare: |error, _| {
                if let DownloadError::EmptyOutput { path } = error {
                    if let Err(e) = std::fs::remove_file(path) {
                        tracing::warn!("Failed to remove zero-byte stub {:?}: {}", path, e);
                    }
                }
            },
            transform: |request| {
                request.format = Some("best[acodec!=none][vcodec!=none]/best".to_string());
                request.overwrite = true;
            },
        },
    ]
}

/// Backoff for a matched rule; the transient rule's backoff depends on
/// the failure class.
pub fn backoff_for(rule: &RetryRule, error: &DownloadError) -> Duration {
    if rule.name == "transient" {
        if let Some(backoff) = tool_message(error).and_then(classify::transient_backoff) {
            return backoff;
        }
    }
    rule.backoff
}

/// Remove leftover `.part`/`.ytdl` files for a request whose resume
/// data is corrupt.
fn clean_partial_artifacts(request: &InvokeRequest) {
    let entries = match std::fs::read_dir(&request.output_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_partial = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "part" || e == "ytdl");
        if is_partial {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove partial file {:?}: {}", path, e);
            } else {
                tracing::info!("Removed stale partial file {:?}", path);
            }
        }
    }
}
