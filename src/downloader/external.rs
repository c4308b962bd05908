// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Subprocess implementations of the downloader boundary.
//!
//! Both tools are driven the same way: spawn the binary with line
//! progress output, parse stdout ticks into [`ProgressUpdate`]s, drain
//! stderr on a side thread for error classification, and kill the
//! child if the progress callback requests cancellation.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::Config;

use super::{
    DownloadError, DownloadOutcome, Downloader, InvokeEvents, InvokeRequest, ProgressUpdate, Tool,
};

/// Routes each request to the tool it names.
pub struct ExternalDownloader {
    ytdlp: YtDlpDownloader,
    gallerydl: GalleryDlDownloader,
}

impl ExternalDownloader {
    pub fn new(config: &Config) -> Self {
        Self {
            ytdlp: YtDlpDownloader::new(&config.ytdlp_path),
            gallerydl: GalleryDlDownloader::new(&config.gallerydl_path),
        }
    }
}

impl Downloader for ExternalDownloader {
    fn invoke(
        &self,
        request: &InvokeRequest,
        events: &mut dyn InvokeEvents,
    ) -> Result<DownloadOutcome, DownloadError> {
        match request.tool {
            Tool::YtDlp => self.ytdlp.invoke(request, events),
            Tool::GalleryDl => self.gallerydl.invoke(request, events),
        }
    }
}

/// yt-dlp progress line, e.g.
/// `[download]  42.5% of ~ 10.25MiB at 1.25MiB/s ETA 00:15`
static YTDLP_PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[download\]\s+(?P<pct>[\d.]+)% of\s+~?\s*(?P<total>\S+)(?:\s+at\s+(?P<speed>\S+))?(?:\s+ETA\s+(?P<eta>\S+))?",
    )
    .expect("yt-dlp progress regex is valid")
});

/// yt-dlp destination line, e.g. `[download] Destination: /path/file.mp4`
static YTDLP_DESTINATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[download\] Destination: (?P<path>.+)$").expect("destination regex is valid")
});

/// yt-dlp merger line, e.g. `[Merger] Merging formats into "/path/file.mkv"`
static YTDLP_MERGER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\[Merger\] Merging formats into "(?P<path>.+)""#).expect("merger regex is valid")
});

/// Video downloader backed by the yt-dlp executable.
pub struct YtDlpDownloader {
    binary: String,
}

impl YtDlpDownloader {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Downloader for YtDlpDownloader {
    fn invoke(
        &self,
        request: &InvokeRequest,
        events: &mut dyn InvokeEvents,
    ) -> Result<DownloadOutcome, DownloadError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--newline")
            .arg("--no-colors")
            .arg("-o")
            .arg(request.output_dir.join("%(title)s [%(id)s].%(ext)s"));

        if request.playlist {
            cmd.arg("--yes-playlist");
        } else {
            cmd.arg("--no-playlist");
        }
        if request.resume {
            cmd.arg("--continue");
        } else {
            cmd.arg("--no-continue");
        }
        if request.overwrite {
            cmd.arg("--force-overwrites");
        }
        if let Some(ref format) = request.format {
            cmd.arg("-f").arg(format);
        }
        if let Some(ref ua) = request.user_agent {
            cmd.arg("--user-agent").arg(ua);
        }
        if let Some(ref referrer) = request.referrer {
            cmd.arg("--referer").arg(referrer);
        }
        cmd.arg(&request.url);

        run_tool(&self.binary, cmd, events, parse_ytdlp_line)
    }
}

/// Gallery downloader backed by the gallery-dl executable. Progress is
/// file-count based: gallery-dl prints one path per downloaded file.
pub struct GalleryDlDownloader {
    binary: String,
}

impl GalleryDlDownloader {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Downloader for GalleryDlDownloader {
    fn invoke(
        &self,
        request: &InvokeRequest,
        events: &mut dyn InvokeEvents,
    ) -> Result<DownloadOutcome, DownloadError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--dest").arg(&request.output_dir);
        if let Some(ref ua) = request.user_agent {
            cmd.arg("-o").arg(format!("user-agent={}", ua));
        }
        cmd.arg(&request.url);

        let mut files = 0u64;
        let parse = move |line: &str, state: &mut LineState| {
            if line.trim().is_empty() {
                return None;
            }
            files += 1;
            state.output_path = Some(PathBuf::from(line.trim_start_matches("# ").trim()));
            state.metadata.insert("files".to_string(), Value::from(files));
            Some(ProgressUpdate {
                downloaded_str: Some(format!("{} files", files)),
                ..Default::default()
            })
        };
        run_tool(&self.binary, cmd, events, parse)
    }
}

/// Per-invocation scratch the line parsers fill in.
#[derive(Default)]
struct LineState {
    output_path: Option<PathBuf>,
    metadata: serde_json::Map<String, Value>,
}

fn parse_ytdlp_line(line: &str, state: &mut LineState) -> Option<ProgressUpdate> {
    if let Some(caps) = YTDLP_DESTINATION.captures(line) {
        state.output_path = Some(PathBuf::from(&caps["path"]));
        return None;
    }
    if let Some(caps) = YTDLP_MERGER.captures(line) {
        // Merged output supersedes the per-stream destination
        state.output_path = Some(PathBuf::from(&caps["path"]));
        return None;
    }
    let caps = YTDLP_PROGRESS.captures(line)?;

    let percent = caps["pct"].parse::<f64>().ok();
    let total_str = caps.name("total").map(|m| m.as_str().to_string());
    let total_bytes = total_str.as_deref().and_then(parse_size);
    let speed_str = caps
        .name("speed")
        .map(|m| m.as_str())
        .filter(|s| !s.starts_with("Unknown"))
        .map(str::to_string);
    let speed_bps = speed_str
        .as_deref()
        .and_then(|s| parse_size(s.trim_end_matches("/s")))
        .map(|b| b as f64);
    let eta_str = caps
        .name("eta")
        .map(|m| m.as_str())
        .filter(|s| *s != "Unknown")
        .map(str::to_string);
    let eta_secs = eta_str.as_deref().and_then(parse_clock);
    let downloaded_bytes = match (percent, total_bytes) {
        (Some(p), Some(t)) => Some(((p / 100.0) * t as f64) as u64),
        _ => None,
    };

    Some(ProgressUpdate {
        percent,
        downloaded_bytes,
        total_bytes,
        speed_bps,
        eta_secs,
        percent_str: percent.map(|p| format!("{:.1}%", p)),
        downloaded_str: None,
        total_str,
        speed_str,
        eta_str,
    })
}

/// Spawn `cmd`, stream its stdout through `parse`, and honor
/// cancellation from the progress callback.
fn run_tool(
    binary: &str,
    mut cmd: Command,
    events: &mut dyn InvokeEvents,
    mut parse: impl FnMut(&str, &mut LineState) -> Option<ProgressUpdate>,
) -> Result<DownloadOutcome, DownloadError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DownloadError::Spawn {
            tool: binary.to_string(),
            source: e,
        })?;

    events.started(Some(child.id()));

    // Drain stderr concurrently so a chatty tool cannot deadlock on a
    // full pipe while we read stdout.
    let stderr = child.stderr.take();
    let stderr_thread = std::thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut text);
        }
        text
    });

    let mut state = LineState::default();
    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if let Some(update) = parse(&line, &mut state) {
                if !events.progress(update) {
                    kill_child(&mut child);
                    let _ = stderr_thread.join();
                    return Err(DownloadError::Canceled);
                }
            }
        }
    }

    let status = child.wait()?;
    let stderr_text = stderr_thread.join().unwrap_or_default();

    if status.success() {
        let mut outcome = DownloadOutcome {
            output_path: state.output_path,
            metadata: state.metadata,
        };
        outcome
            .metadata
            .entry("tool".to_string())
            .or_insert_with(|| Value::String(binary.to_string()));
        Ok(outcome)
    } else {
        let message = if stderr_text.trim().is_empty() {
            format!("{} exited with {}", binary, status)
        } else {
            error_tail(&stderr_text)
        };
        Err(DownloadError::Tool { message })
    }
}

fn kill_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Last few stderr lines; enough for classification without dumping the
/// tool's entire log into the tracker.
fn error_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

/// Parse sizes like `10.25MiB`, `512KiB`, `3.1GiB`, `815B`.
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s.find(|c: char| c.is_alphabetic())?;
    let (num, unit) = s.split_at(split);
    let num: f64 = num.parse().ok()?;
    let factor = match unit {
        "B" => 1.0,
        "KiB" | "KB" => 1024.0,
        "MiB" | "MB" => 1024.0 * 1024.0,
        "GiB" | "GB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" | "TB" => 1024.0f64.powi(4),
        _ => return None,
    };
    Some((num * factor) as u64)
}

/// Parse clock-style ETAs like `00:15`, `1:02:03`, or plain seconds.
fn parse_clock(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.split(':').collect();
    let mut secs = 0u64;
    for part in &parts {
        secs = secs * 60 + part.parse::<u64>().ok()?;
    }
    if parts.is_empty() {
        None
    } else {
        Some(secs)
    }
}
