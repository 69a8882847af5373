//! API integration tests.
//!
//! Tests HTTP API endpoints against a [`TestHarness`] server running on a
//! random port with a scripted prober and encoder.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{HarnessOptions, ScriptedEncoder, TestHarness};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};

async fn upload(addr: SocketAddr, filename: &str, size: usize) -> reqwest::Response {
    let part = Part::bytes(vec![7u8; size])
        .file_name(filename.to_string())
        .mime_str("video/mp4")
        .unwrap();
    reqwest::Client::new()
        .post(format!("http://{addr}/upload"))
        .multipart(Form::new().part("file", part))
        .send()
        .await
        .expect("upload request failed")
}

async fn upload_ok(addr: SocketAddr, filename: &str, size: usize) -> String {
    let resp = upload(addr, filename, size).await;
    assert_eq!(resp.status(), 200);
    let json: Value = resp.json().await.unwrap();
    json["job_id"].as_str().unwrap().to_string()
}

async fn compress(addr: SocketAddr, job_id: &str, target_size: u64) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/compress"))
        .json(&json!({ "job_id": job_id, "target_size": target_size }))
        .send()
        .await
        .expect("compress request failed")
}

async fn status(addr: SocketAddr, job_id: &str) -> reqwest::Response {
    reqwest::get(format!("http://{addr}/status/{job_id}"))
        .await
        .expect("status request failed")
}

async fn wait_for_terminal(addr: SocketAddr, job_id: &str) -> Value {
    for _ in 0..500 {
        let json: Value = status(addr, job_id).await.json().await.unwrap();
        if json["status"] == "completed" || json["status"] == "error" {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} did not finish");
}

// ---------------------------------------------------------------------------
// Health and docs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_returns_200() {
    let (_harness, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["jobs"], 0);
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn openapi_document_is_served() {
    let (_harness, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(format!("http://{addr}/api/openapi.json"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["info"]["title"], "Sizeforge API");
    assert!(json["paths"]["/compress"]["post"].is_object());
}

// ---------------------------------------------------------------------------
// Full flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_compress_download_cleanup() {
    let (harness, addr) = TestHarness::with_server().await;

    let resp = upload(addr, "my clip.mov", 1_000_000).await;
    assert_eq!(resp.status(), 200);
    let receipt: Value = resp.json().await.unwrap();
    assert_eq!(receipt["filename"], "my_clip.mov");
    assert_eq!(receipt["original_size"], 1_000_000);
    assert_eq!(receipt["duration"], 10.0);
    let job_id = receipt["job_id"].as_str().unwrap().to_string();

    let json: Value = status(addr, &job_id).await.json().await.unwrap();
    assert_eq!(json["status"], "uploaded");
    assert_eq!(json["progress"], 0.0);

    let resp = compress(addr, &job_id, 500_000).await;
    assert_eq!(resp.status(), 200);
    let started: Value = resp.json().await.unwrap();
    assert_eq!(started["accepted"], true);
    assert_eq!(started["video_bitrate"], 272_000);
    assert_eq!(started["audio_bitrate"], 128_000);

    let done = wait_for_terminal(addr, &job_id).await;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["progress"], 1.0);
    assert!(done.get("error").is_none());
    let output_size = done["output_size"].as_u64().unwrap();

    let resp = reqwest::get(format!("http://{addr}/download/{job_id}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "video/mp4");
    let disposition = resp.headers()["content-disposition"].to_str().unwrap();
    assert!(disposition.contains("compressed_my_clip.mp4"), "{disposition}");
    let bytes = resp.bytes().await.unwrap();
    assert_eq!(bytes.len() as u64, output_size);

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/cleanup/{job_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json, json!({ "ok": true, "existed": true }));

    assert_eq!(status(addr, &job_id).await.status(), 404);
    assert!(harness.stored_files().is_empty());
}

#[tokio::test]
async fn status_since_returns_only_new_lines() {
    let (_harness, addr) = TestHarness::with_server().await;
    let job_id = upload_ok(addr, "clip.mp4", 1_000_000).await;

    let first: Value = status(addr, &job_id).await.json().await.unwrap();
    let count = first["log_count"].as_u64().unwrap();
    assert_eq!(first["log_offset"], 0);
    assert_eq!(first["logs"].as_array().unwrap().len() as u64, count);

    compress(addr, &job_id, 500_000).await;
    wait_for_terminal(addr, &job_id).await;

    let resp = reqwest::get(format!("http://{addr}/status/{job_id}?since={count}"))
        .await
        .unwrap();
    let later: Value = resp.json().await.unwrap();
    assert_eq!(later["log_offset"], count);
    let new_lines = later["logs"].as_array().unwrap();
    assert!(!new_lines.is_empty());
    assert_eq!(
        later["log_count"].as_u64().unwrap(),
        count + new_lines.len() as u64
    );
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn target_too_small_is_422_and_errors_the_job() {
    let (harness, addr) = TestHarness::with_server().await;
    let job_id = upload_ok(addr, "clip.mp4", 1_000_000).await;

    let resp = compress(addr, &job_id, 100_000).await;
    assert_eq!(resp.status(), 422);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["code"], "target_too_small");

    let json: Value = status(addr, &job_id).await.json().await.unwrap();
    assert_eq!(json["status"], "error");
    assert!(json["error"].as_str().unwrap().contains("too small"));
    assert_eq!(harness.encoder.passes_run(), 0);
}

#[tokio::test]
async fn target_not_smaller_than_original_is_400() {
    let (_harness, addr) = TestHarness::with_server().await;
    let job_id = upload_ok(addr, "clip.mp4", 1_000_000).await;

    let resp = compress(addr, &job_id, 2_000_000).await;
    assert_eq!(resp.status(), 400);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["code"], "validation_error");

    let json: Value = status(addr, &job_id).await.json().await.unwrap();
    assert_eq!(json["status"], "uploaded");
}

#[tokio::test]
async fn malformed_compress_body_is_400() {
    let (harness, addr) = TestHarness::with_server().await;
    let job_id = upload_ok(addr, "clip.mp4", 1_000_000).await;
    let client = reqwest::Client::new();

    for body in [
        json!({ "job_id": job_id, "target_size": -5 }),
        json!({ "job_id": job_id, "target_size": "500000" }),
        json!({ "job_id": job_id }),
    ] {
        let resp = client
            .post(format!("http://{addr}/compress"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{body}");
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["code"], "validation_error");
        assert!(json["error"].as_str().unwrap().contains("target_size"), "{json}");
    }

    let resp = client
        .post(format!("http://{addr}/compress"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["code"], "validation_error");

    let json: Value = status(addr, &job_id).await.json().await.unwrap();
    assert_eq!(json["status"], "uploaded");
    assert_eq!(harness.encoder.passes_run(), 0);
}

#[tokio::test]
async fn compress_after_error_retries_on_a_new_job() {
    let (_harness, addr) = TestHarness::with_server().await;
    let job_id = upload_ok(addr, "clip.mp4", 1_000_000).await;
    assert_eq!(compress(addr, &job_id, 100_000).await.status(), 422);

    let resp = compress(addr, &job_id, 400_000).await;
    assert_eq!(resp.status(), 200);
    let retry: Value = resp.json().await.unwrap();
    assert_eq!(retry["retry_of"], job_id.as_str());
    let retry_id = retry["job_id"].as_str().unwrap().to_string();
    assert_ne!(retry_id, job_id);

    let done = wait_for_terminal(addr, &retry_id).await;
    assert_eq!(done["status"], "completed");

    let old: Value = status(addr, &job_id).await.json().await.unwrap();
    assert_eq!(old["status"], "error");
    assert_eq!(old["retried_as"], retry_id.as_str());

    let resp = compress(addr, &job_id, 400_000).await;
    assert_eq!(resp.status(), 409);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["code"], "conflict");
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let (_harness, addr) = TestHarness::with_server().await;
    let unknown = "6f1c1b55-3a39-4c3e-9d43-5a3f0e3b8d10";

    let resp = status(addr, unknown).await;
    assert_eq!(resp.status(), 404);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["code"], "not_found");

    assert_eq!(compress(addr, unknown, 500_000).await.status(), 404);
    assert_eq!(status(addr, "not-a-uuid").await.status(), 400);
    assert_eq!(
        reqwest::get(format!("http://{addr}/download/{unknown}"))
            .await
            .unwrap()
            .status(),
        404
    );
}

#[tokio::test]
async fn download_before_completion_is_409() {
    let (harness, addr) = TestHarness::with_server_options(HarnessOptions {
        encoder: ScriptedEncoder {
            hold: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let job_id = upload_ok(addr, "clip.mp4", 1_000_000).await;

    let resp = reqwest::get(format!("http://{addr}/download/{job_id}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    assert_eq!(compress(addr, &job_id, 500_000).await.status(), 200);
    assert_eq!(compress(addr, &job_id, 500_000).await.status(), 409);
    let json: Value = status(addr, &job_id).await.json().await.unwrap();
    assert_eq!(json["status"], "compressing");

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn cleanup_is_idempotent_on_both_routes() {
    let (_harness, addr) = TestHarness::with_server().await;
    let job_id = upload_ok(addr, "clip.mp4", 1_000_000).await;
    let client = reqwest::Client::new();

    let resp = client
        .delete(format!("http://{addr}/jobs/{job_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["existed"], true);

    let resp = client
        .post(format!("http://{addr}/cleanup/{job_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json, json!({ "ok": true, "existed": false }));
}

#[tokio::test]
async fn cleanup_while_compressing_stops_the_job() {
    let (harness, addr) = TestHarness::with_server_options(HarnessOptions {
        encoder: ScriptedEncoder {
            hold: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let job_id = upload_ok(addr, "clip.mp4", 1_000_000).await;
    assert_eq!(compress(addr, &job_id, 500_000).await.status(), 200);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/cleanup/{job_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    assert_eq!(harness.encoder.cancelled(), 1);
    assert_eq!(status(addr, &job_id).await.status(), 404);
    assert!(harness.stored_files().is_empty());
}

// ---------------------------------------------------------------------------
// Upload validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_rejects_bad_requests() {
    let (harness, addr) = TestHarness::with_server_options(HarnessOptions {
        max_upload_bytes: 4 * 1024,
        ..Default::default()
    })
    .await;

    let resp = upload(addr, "notes.txt", 100).await;
    assert_eq!(resp.status(), 400);

    let resp = upload(addr, "huge.mp4", 8 * 1024).await;
    assert_eq!(resp.status(), 400);

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/upload"))
        .multipart(Form::new().text("other", "value"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let json: Value = resp.json().await.unwrap();
    assert!(json["error"].as_str().unwrap().contains("file"));

    assert!(harness.orchestrator.registry().is_empty());
    assert!(harness.stored_files().is_empty());
}

#[tokio::test]
async fn unreadable_upload_is_400() {
    let (harness, addr) = TestHarness::with_server_options(HarnessOptions {
        probe_fails: true,
        ..Default::default()
    })
    .await;

    let resp = upload(addr, "clip.mp4", 1024).await;
    assert_eq!(resp.status(), 400);
    assert!(harness.stored_files().is_empty());
}
