// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Configuration for dlserve.
//!
//! Stored as JSON under `~/.dlserve/config.json`. The dispatch worker
//! re-reads `max_concurrent_downloads` from disk on every scheduling
//! iteration, so edits take effect without a restart.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default port the HTTP API listens on.
pub const DEFAULT_PORT: u16 = 17843;

/// Default cap on concurrently running downloads.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default grace period before finished/error/canceled entries are evicted.
pub const DEFAULT_FINISHED_TTL_SECS: u64 = 3600;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind to (127.0.0.1 by default; this is a local API).
    pub bind_address: String,
    /// Directory completed downloads land in.
    pub download_dir: PathBuf,
    /// Maximum number of downloads running at once.
    pub max_concurrent_downloads: usize,
    /// Seconds a terminal tracker entry is retained before eviction.
    pub finished_ttl_secs: u64,
    /// Path to the yt-dlp binary.
    pub ytdlp_path: String,
    /// Path to the gallery-dl binary.
    pub gallerydl_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "127.0.0.1".to_string(),
            download_dir: default_download_dir(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT,
            finished_ttl_secs: DEFAULT_FINISHED_TTL_SECS,
            ytdlp_path: "yt-dlp".to_string(),
            gallerydl_path: "gallery-dl".to_string(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

/// Get (and create if needed) the dlserve config directory.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let dir = home.join(".dlserve");
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
    }
    Ok(dir)
}

/// Path of the persisted queue snapshot file.
pub fn queue_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("queue.json"))
}

/// Path of the append-only download history log.
pub fn history_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("history.jsonl"))
}

/// Load the config file, falling back to defaults when absent.
pub fn load_config() -> Result<Config> {
    let config_path = config_dir()?.join("config.json");
    if config_path.exists() {
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config: {:?}", config_path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| "Failed to parse config file")?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

/// Persist the config file.
pub fn save_config(config: &Config) -> Result<()> {
    let config_path = config_dir()?.join("config.json");
    let content = serde_json::to_string_pretty(config)
        .with_context(|| "Failed to serialize config")?;
    fs::write(&config_path, content)
        .with_context(|| format!("Failed to write config: {:?}", config_path))?;
    Ok(())
}

/// Current capacity limit, read live from disk so config edits apply
/// between scheduler iterations. Falls back to the default on any error.
pub fn current_capacity() -> usize {
    load_config()
        .map(|c| c.max_concurrent_downloads.max(1))
        .unwrap_or(DEFAULT_MAX_CONCURRENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_concurrent_downloads, DEFAULT_MAX_CONCURRENT);
        assert_eq!(config.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = Config::default();
        config.max_concurrent_downloads = 7;
        config.port = 9000;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_concurrent_downloads, 7);
        assert_eq!(parsed.port, 9000);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"port": 1234}"#).unwrap();
        assert_eq!(parsed.port, 1234);
        assert_eq!(parsed.max_concurrent_downloads, DEFAULT_MAX_CONCURRENT);
        assert_eq!(parsed.ytdlp_path, "yt-dlp");
    }
}
