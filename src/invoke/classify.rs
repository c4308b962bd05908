// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Downloader error classification.
//!
//! Raw tool error text is matched against a table of known signatures
//! to produce a structured code plus a troubleshooting hint the status
//! API can surface. Unmatched text falls back to `unknown` while still
//! carrying the original message for diagnostics.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Structured classification of a terminal download failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    /// Stable machine-readable code.
    pub code: &'static str,
    /// The raw downloader message.
    pub message: String,
    /// User-facing troubleshooting hint.
    pub hint: &'static str,
}

struct Signature {
    pattern: Regex,
    code: &'static str,
    hint: &'static str,
}

fn sig(pattern: &str, code: &'static str, hint: &'static str) -> Signature {
    Signature {
        pattern: Regex::new(pattern).expect("error signature regex is valid"),
        code,
        hint,
    }
}

static SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    vec![
        sig(
            r"(?i)HTTP Error 429|too many requests|rate.?limit",
            "rate_limited",
            "The site is rate-limiting requests. Wait a few minutes and retry.",
        ),
        sig(
            r"(?i)HTTP Error 503|service unavailable",
            "unavailable",
            "The site is temporarily unavailable. Retry later.",
        ),
        sig(
            r"(?i)HTTP Error 502|bad gateway",
            "bad_gateway",
            "The site's server returned a bad gateway error. Retry later.",
        ),
        sig(
            r"(?i)HTTP Error 416|requested range not satisfiable",
            "stale_range",
            "A stale partial file could not be resumed. It will be re-downloaded from scratch.",
        ),
        sig(
            r"(?i)timed? ?out|timeout",
            "timeout",
            "The connection timed out. Check your network and retry.",
        ),
        sig(
            r"(?i)unable to download|connection (reset|refused)|network (is )?unreachable|temporary failure in name resolution",
            "network",
            "A network error interrupted the download. Check connectivity and retry.",
        ),
        sig(
            r"(?i)unsupported url|no suitable extractor",
            "unsupported_url",
            "This site is not supported by the downloader. Check the URL.",
        ),
        sig(
            r"(?i)video unavailable|this video is not available|content isn't available",
            "video_unavailable",
            "The video has been removed or is not available.",
        ),
        sig(
            r"(?i)private video|sign in to confirm|login required|members.?only",
            "private_video",
            "The content requires a login. Supply cookies or credentials.",
        ),
        sig(
            r"(?i)not available in your country|geo.?(blocked|restricted)",
            "geo_blocked",
            "The content is region-locked. A proxy in an allowed region may help.",
        ),
        sig(
            r"(?i)age.?restricted|confirm your age",
            "age_restricted",
            "The content is age-restricted and needs authenticated cookies.",
        ),
        sig(
            r"(?i)drm|this video is protected",
            "drm_protected",
            "The content is DRM-protected and cannot be downloaded.",
        ),
        sig(
            r"(?i)no such file or directory|not found.*(yt-dlp|gallery-dl)|failed to start",
            "tool_missing",
            "The downloader binary was not found. Install yt-dlp/gallery-dl or fix its path in the config.",
        ),
        sig(
            r"(?i)disk.*full|no space left on device",
            "disk_full",
            "The disk is full. Free up space and retry.",
        ),
    ]
});

/// Classify raw downloader error text.
pub fn classify(raw: &str) -> ErrorInfo {
    for signature in SIGNATURES.iter() {
        if signature.pattern.is_match(raw) {
            return ErrorInfo {
                code: signature.code,
                message: raw.to_string(),
                hint: signature.hint,
            };
        }
    }
    ErrorInfo {
        code: "unknown",
        message: raw.to_string(),
        hint: "An unrecognized error occurred. The raw downloader message is included above.",
    }
}

/// Backoff to apply before the one-shot retry of a transient failure,
/// or `None` when the failure class is not considered transient.
pub fn transient_backoff(raw: &str) -> Option<Duration> {
    match classify(raw).code {
        "rate_limited" => Some(Duration::from_secs(30)),
        "unavailable" => Some(Duration::from_secs(15)),
        "bad_gateway" => Some(Duration::from_secs(10)),
        "timeout" => Some(Duration::from_secs(10)),
        "network" => Some(Duration::from_secs(5)),
        _ => None,
    }
}

/// Whether the text indicates a stale partial file (HTTP 416 class).
pub fn is_stale_range(raw: &str) -> bool {
    classify(raw).code == "stale_range"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_signatures() {
        assert_eq!(classify("ERROR: HTTP Error 429: Too Many Requests").code, "rate_limited");
        assert_eq!(classify("HTTP Error 503: Service Unavailable").code, "unavailable");
        assert_eq!(
            classify("HTTP Error 416: Requested Range Not Satisfiable").code,
            "stale_range"
        );
        assert_eq!(classify("ERROR: Video unavailable").code, "video_unavailable");
        assert_eq!(
            classify("ERROR: Sign in to confirm you're not a bot").code,
            "private_video"
        );
        assert_eq!(classify("ERROR: Unsupported URL: http://x").code, "unsupported_url");
        assert_eq!(
            classify("The uploader has not made this video available in your country").code,
            "geo_blocked"
        );
        assert_eq!(classify("read operation timed out").code, "timeout");
    }

    #[test]
    fn test_unknown_preserves_message() {
        let info = classify("something entirely novel went wrong");
        assert_eq!(info.code, "unknown");
        assert_eq!(info.message, "something entirely novel went wrong");
        assert!(!info.hint.is_empty());
    }

    #[test]
    fn test_transient_backoffs() {
        assert_eq!(
            transient_backoff("HTTP Error 429: Too Many Requests"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            transient_backoff("connection reset by peer"),
            Some(Duration::from_secs(5))
        );
        assert_eq!(transient_backoff("ERROR: Video unavailable"), None);
        // Stale range is retried with different options, not a plain backoff
        assert_eq!(transient_backoff("HTTP Error 416"), None);
    }

    #[test]
    fn test_stale_range_detection() {
        assert!(is_stale_range("HTTP Error 416: Requested Range Not Satisfiable"));
        assert!(!is_stale_range("HTTP Error 429"));
    }
}
