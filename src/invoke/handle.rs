// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Control handles for dispatched downloads.
//!
//! A handle is how cancel/pause/resume/priority requests reach a
//! running download. Two variants exist: one backed by the external
//! tool's OS process, and a cooperative one that only flips the shared
//! signal sets (used before a process exists, and for in-process
//! downloaders). Termination is cooperative in both cases: the request
//! is observed by the progress callback, not forced on the transfer.

use std::sync::Arc;

use crate::context::SignalSets;

/// Cancel/pause/resume/priority operations on a running download.
pub trait ControlHandle: Send + Sync {
    /// Request cancellation. Observed at the next progress tick.
    fn terminate(&self);

    /// Same contract as [`terminate`](ControlHandle::terminate); kept
    /// as a distinct operation for callers that expect both names.
    fn kill(&self) {
        self.terminate();
    }

    /// Request a pause.
    fn suspend(&self);

    /// Clear a pause request.
    fn resume(&self);

    /// Best-effort priority hint; no guarantee it takes effect.
    fn set_priority(&self, priority: i32);

    /// Pid of the backing process, when there is one.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Signal-set-only handle. Pausing freezes observable progress but
/// does not stop the underlying transfer.
pub struct CooperativeHandle {
    id: String,
    signals: Arc<SignalSets>,
}

impl CooperativeHandle {
    pub fn new(id: impl Into<String>, signals: Arc<SignalSets>) -> Self {
        Self {
            id: id.into(),
            signals,
        }
    }
}

impl ControlHandle for CooperativeHandle {
    fn terminate(&self) {
        self.signals.request_cancel(&self.id);
    }

    fn suspend(&self) {
        self.signals.request_pause(&self.id);
    }

    fn resume(&self) {
        self.signals.clear_pause(&self.id);
    }

    fn set_priority(&self, priority: i32) {
        tracing::debug!(
            "Priority hint {} for {} ignored (no backing process)",
            priority,
            self.id
        );
    }
}

/// Handle backed by the external tool's process. Suspend/resume
/// additionally stop and continue the process itself; priority maps to
/// the OS nice level.
pub struct ProcessHandle {
    id: String,
    pid: u32,
    signals: Arc<SignalSets>,
}

impl ProcessHandle {
    pub fn new(id: impl Into<String>, pid: u32, signals: Arc<SignalSets>) -> Self {
        Self {
            id: id.into(),
            pid,
            signals,
        }
    }
}

impl ControlHandle for ProcessHandle {
    fn terminate(&self) {
        self.signals.request_cancel(&self.id);
    }

    fn suspend(&self) {
        self.signals.request_pause(&self.id);
        send_signal(self.pid, "STOP");
    }

    fn resume(&self) {
        self.signals.clear_pause(&self.id);
        send_signal(self.pid, "CONT");
    }

    fn set_priority(&self, priority: i32) {
        renice(self.pid, priority);
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: &str) {
    let status = std::process::Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .status();
    if let Err(e) = status {
        tracing::warn!("Failed to send SIG{} to pid {}: {}", signal, pid, e);
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: &str) {
    tracing::debug!("SIG{} for pid {} not supported on this platform", signal, pid);
}

#[cfg(unix)]
fn renice(pid: u32, priority: i32) {
    let status = std::process::Command::new("renice")
        .arg(priority.to_string())
        .arg("-p")
        .arg(pid.to_string())
        .status();
    if let Err(e) = status {
        tracing::warn!("Failed to renice pid {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn renice(pid: u32, _priority: i32) {
    tracing::debug!("renice for pid {} not supported on this platform", pid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooperative_terminate_sets_cancel_signal() {
        let signals = Arc::new(SignalSets::default());
        let handle = CooperativeHandle::new("d1", Arc::clone(&signals));

        handle.terminate();
        assert!(signals.take_cancel("d1"));
    }

    #[test]
    fn test_kill_defaults_to_terminate() {
        let signals = Arc::new(SignalSets::default());
        let handle = CooperativeHandle::new("d1", Arc::clone(&signals));

        handle.kill();
        assert!(signals.take_cancel("d1"));
    }

    #[test]
    fn test_pid_reported_only_for_process_backed_handle() {
        let signals = Arc::new(SignalSets::default());
        let cooperative = CooperativeHandle::new("d1", Arc::clone(&signals));
        let process = ProcessHandle::new("d1", 4242, signals);

        assert_eq!(ControlHandle::pid(&cooperative), None);
        assert_eq!(ControlHandle::pid(&process), Some(4242));
    }

    #[test]
    fn test_suspend_and_resume_toggle_pause() {
        let signals = Arc::new(SignalSets::default());
        let handle = CooperativeHandle::new("d1", Arc::clone(&signals));

        handle.suspend();
        assert!(signals.is_paused("d1"));
        handle.resume();
        assert!(!signals.is_paused("d1"));
    }
}
