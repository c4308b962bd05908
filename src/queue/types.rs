// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Queue data types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A queued, not-yet-dispatched download request.
///
/// The canonical id key on the wire and on disk is `downloadId`; the
/// legacy `download_id` key is still accepted on load and migrated on
/// the next persist. Option fields (format, playlist, output dir, user
/// agent, referrer, ...) are carried as-is and interpreted at dispatch
/// time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    #[serde(rename = "downloadId", alias = "download_id")]
    pub download_id: String,
    pub url: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

impl TaskRecord {
    /// Create a task with an explicit id.
    pub fn new(download_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            download_id: download_id.into(),
            url: url.into(),
            options: serde_json::Map::new(),
        }
    }

    /// Create a task with a server-generated id.
    pub fn with_generated_id(url: impl Into<String>) -> Self {
        Self::new(uuid_v4(), url)
    }

    /// Set an option field, builder-style.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Read an option as a string, if present.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    /// Read an option as a bool, defaulting to false.
    pub fn option_bool(&self, key: &str) -> bool {
        self.options
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Generate a random UUID v4 string for server-assigned download ids.
pub fn uuid_v4() -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes);

    // Set version (4) and variant (RFC 4122) bits
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5], bytes[6], bytes[7],
        bytes[8], bytes[9], bytes[10], bytes[11],
        bytes[12], bytes[13], bytes[14], bytes[15]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_canonical_key() {
        let task = TaskRecord::new("a1", "http://example.com/v");
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"downloadId\":\"a1\""));
        assert!(!json.contains("download_id"));
    }

    #[test]
    fn test_accepts_legacy_key() {
        let task: TaskRecord =
            serde_json::from_str(r#"{"download_id":"old","url":"http://x/1"}"#).unwrap();
        assert_eq!(task.download_id, "old");
    }

    #[test]
    fn test_options_survive_round_trip() {
        let task = TaskRecord::new("a1", "http://x/1")
            .with_option("format", Value::String("best".into()))
            .with_option("playlist", Value::Bool(true));

        let json = serde_json::to_string(&task).unwrap();
        let parsed: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.option_str("format"), Some("best"));
        assert!(parsed.option_bool("playlist"));
    }

    #[test]
    fn test_uuid_shape() {
        let id = uuid_v4();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
        assert_ne!(id, uuid_v4());
    }
}
