mod common;

use common::*;
use serde_json::json;
use std::time::Duration;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn download_happy_path_places_the_file() {
    let content = payload(160 * 1024);
    let (origin_url, _) = spawn_origin(content.clone(), true, None).await;
    let broker = spawn_broker("http://127.0.0.1:9/unused").await;
    let mut client = WsClient::connect(&broker.ws_url()).await;

    client
        .send_json(json!({"action": "download-start", "fileId": "D1", "url": origin_url}))
        .await;
    let ack = client.recv_event("download-start-ack").await;
    assert_eq!(ack["filename"], "file.bin");
    assert_eq!(ack["offset"], 0);

    let info = client.recv_event("download-info").await;
    assert_eq!(info["totalSize"], content.len() as u64);
    assert_eq!(info["supportsResume"], false);

    let done = client.recv_event("download-complete").await;
    assert_eq!(done["filename"], "file.bin");
    assert_eq!(done["totalSize"], content.len() as u64);

    let placed = broker.downloads_path().join("file.bin");
    assert_eq!(std::fs::read(&placed).unwrap(), content);
    // the staging temp was moved, not copied
    assert_eq!(
        std::fs::read_dir(broker.staging_path()).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn download_collision_appends_a_suffix() {
    let content = payload(1024);
    let (origin_url, _) = spawn_origin(content.clone(), true, None).await;
    let broker = spawn_broker("http://127.0.0.1:9/unused").await;
    std::fs::write(broker.downloads_path().join("file.bin"), b"occupied").unwrap();

    let mut client = WsClient::connect(&broker.ws_url()).await;
    client
        .send_json(json!({"action": "download-start", "fileId": "D2", "url": origin_url}))
        .await;
    let done = client.recv_event("download-complete").await;
    assert_eq!(done["filename"], "file_1.bin");
    assert_eq!(
        std::fs::read(broker.downloads_path().join("file_1.bin")).unwrap(),
        content
    );
}

#[tokio::test]
async fn pause_and_resume_uses_a_range_request() {
    let content = payload(512 * 1024);
    let (origin_url, ranges) =
        spawn_origin(content.clone(), true, Some(Duration::from_millis(25))).await;
    let broker = spawn_broker("http://127.0.0.1:9/unused").await;
    let mut client = WsClient::connect(&broker.ws_url()).await;

    client
        .send_json(json!({"action": "download-start", "fileId": "D3", "url": origin_url}))
        .await;
    client.recv_event("download-start-ack").await;
    client.recv_event("download-info").await;

    // wait until bytes are flowing, then pause mid-body
    let progress = client.recv_event("download-progress").await;
    assert!(progress["downloadedBytes"].as_u64().unwrap() > 0);
    client
        .send_json(json!({"action": "download-pause", "fileId": "D3"}))
        .await;
    client.recv_event("download-pause-ack").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let temp = broker.staging_path().join("D3_file.bin.download");
    let staged = std::fs::metadata(&temp).unwrap().len();
    assert!(staged > 0 && staged < content.len() as u64);

    client
        .send_json(json!({"action": "download-resume", "fileId": "D3"}))
        .await;
    // the resume-ack races the restarted task's own events; wait for the
    // info event and let anything before it pass by
    let info = client.recv_event("download-info").await;
    assert_eq!(info["supportsResume"], true);

    let done = client.recv_event("download-complete").await;
    assert_eq!(done["totalSize"], content.len() as u64);
    assert_eq!(
        std::fs::read(broker.downloads_path().join("file.bin")).unwrap(),
        content
    );

    // the second request carried the staged offset
    let log = ranges.lock().await;
    assert_eq!(log.len(), 2);
    assert_eq!(log[0], None);
    assert_eq!(log[1].as_deref(), Some(format!("bytes={staged}-").as_str()));
}

#[tokio::test]
async fn an_origin_ignoring_range_restarts_the_body() {
    let content = payload(512 * 1024);
    let (origin_url, ranges) =
        spawn_origin(content.clone(), false, Some(Duration::from_millis(25))).await;
    let broker = spawn_broker("http://127.0.0.1:9/unused").await;
    let mut client = WsClient::connect(&broker.ws_url()).await;

    client
        .send_json(json!({"action": "download-start", "fileId": "D4", "url": origin_url}))
        .await;
    client.recv_event("download-progress").await;
    client
        .send_json(json!({"action": "download-pause", "fileId": "D4"}))
        .await;
    client.recv_event("download-pause-ack").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    client
        .send_json(json!({"action": "download-resume", "fileId": "D4"}))
        .await;
    let info = client.recv_event("download-info").await;
    assert_eq!(info["supportsResume"], false);

    // a 200 after a Range request resets the temp file; the placed file must
    // be byte-exact, not doubled
    client.recv_event("download-complete").await;
    assert_eq!(
        std::fs::read(broker.downloads_path().join("file.bin")).unwrap(),
        content
    );

    let log = ranges.lock().await;
    assert_eq!(log.len(), 2);
    assert!(log[1].is_some());
}

#[tokio::test]
async fn stop_cancels_and_deletes_the_temp_file() {
    let content = payload(512 * 1024);
    let (origin_url, _) =
        spawn_origin(content.clone(), true, Some(Duration::from_millis(25))).await;
    let broker = spawn_broker("http://127.0.0.1:9/unused").await;
    let mut client = WsClient::connect(&broker.ws_url()).await;

    client
        .send_json(json!({"action": "download-start", "fileId": "D5", "url": origin_url}))
        .await;
    client.recv_event("download-progress").await;

    client
        .send_json(json!({"action": "download-stop", "fileId": "D5"}))
        .await;
    client.recv_event("download-stop-ack").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!broker.staging_path().join("D5_file.bin.download").exists());

    // the session is gone, so resume has nothing to pick up
    client
        .send_json(json!({"action": "download-resume", "fileId": "D5"}))
        .await;
    let err = client.recv_json().await;
    assert_eq!(err["event"], "download-error");
    assert_eq!(err["error"], "Failed to resume download");
}

#[tokio::test]
async fn download_start_requires_a_url() {
    let broker = spawn_broker("http://127.0.0.1:9/unused").await;
    let mut client = WsClient::connect(&broker.ws_url()).await;

    client
        .send_json(json!({"action": "download-start", "fileId": "D6"}))
        .await;
    let err = client.recv_json().await;
    assert_eq!(err["event"], "download-error");
    assert_eq!(err["error"], "URL is required");
    assert_eq!(err["fileId"], "D6");
}

#[tokio::test]
async fn filename_override_wins_over_the_url_basename() {
    let content = payload(2048);
    let (origin_url, _) = spawn_origin(content.clone(), true, None).await;
    let broker = spawn_broker("http://127.0.0.1:9/unused").await;
    let mut client = WsClient::connect(&broker.ws_url()).await;

    client
        .send_json(json!({
            "action": "download-start",
            "fileId": "D7",
            "url": origin_url,
            "filename": "renamed.dat"
        }))
        .await;
    let ack = client.recv_event("download-start-ack").await;
    assert_eq!(ack["filename"], "renamed.dat");
    let done = client.recv_event("download-complete").await;
    assert_eq!(done["filename"], "renamed.dat");
    assert_eq!(
        std::fs::read(broker.downloads_path().join("renamed.dat")).unwrap(),
        content
    );
}
