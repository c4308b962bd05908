//! Integration tests for the dlserve HTTP API.
//!
//! These hit a live server and are marked with #[ignore] so they don't
//! run in CI without one.
//!
//! To run these tests:
//! 1. Start the server: dlserve
//! 2. Run tests with: cargo test --test integration_tests -- --ignored

use reqwest::Client;
use serde_json::{json, Value};

const BASE: &str = "http://localhost:17843";

// =============================================================================
// Health Endpoint Tests
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_health_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new();
    let response = client.get(format!("{}/health", BASE)).send().await?;

    assert_eq!(response.status(), 200);

    let json: Value = response.json().await?;
    assert_eq!(json["status"].as_str(), Some("ok"));
    assert!(json.get("version").is_some());
    assert!(json["active"].is_u64());
    assert!(json["queued"].is_u64());

    Ok(())
}

// =============================================================================
// Submission and Status Tests
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_submit_and_track() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new();
    let body = json!({
        "url": "https://example.com/not-a-real-video",
        "downloadId": "itest-submit"
    });

    let response = client
        .post(format!("{}/api/download", BASE))
        .json(&body)
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let json: Value = response.json().await?;
    assert_eq!(json["downloadId"].as_str(), Some("itest-submit"));
    let disposition = json["status"].as_str().unwrap();
    assert!(disposition == "started" || disposition == "queued");

    // The id shows up in the status map almost immediately
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let status: Value = client
        .get(format!("{}/api/status/itest-submit", BASE))
        .send()
        .await?
        .json()
        .await?;
    assert!(status.get("status").is_some());

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_submit_rejects_empty_url() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new();
    let response = client
        .post(format!("{}/api/download", BASE))
        .json(&json!({ "url": "" }))
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    Ok(())
}

// =============================================================================
// Queue Endpoint Tests
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_queue_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new();
    let response = client.get(format!("{}/api/queue", BASE)).send().await?;
    assert_eq!(response.status(), 200);

    let json: Value = response.json().await?;
    assert!(json["queue"].is_array());

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_unknown_ids_return_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new();

    let response = client
        .get(format!("{}/api/status/no-such-id", BASE))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    let response = client
        .delete(format!("{}/api/queue/no-such-id", BASE))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("{}/api/download/no-such-id/pause", BASE))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    Ok(())
}

// =============================================================================
// History Endpoint Tests
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_history_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new();
    let response = client.get(format!("{}/api/history", BASE)).send().await?;
    assert_eq!(response.status(), 200);

    let json: Value = response.json().await?;
    assert!(json["history"].is_array());

    Ok(())
}
