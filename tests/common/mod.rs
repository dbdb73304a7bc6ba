#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use droprelay::catalog::NoopCatalog;
use droprelay::common::BrokerConfig;
use droprelay::server::{self, BrokerState};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn b64(data: &[u8]) -> String {
    BASE64.encode(data)
}

//===============
// Broker under test
//===============

pub struct TestBroker {
    pub addr: SocketAddr,
    staging: TempDir,
    downloads: TempDir,
}

impl TestBroker {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    pub fn downloads_path(&self) -> &Path {
        self.downloads.path()
    }
}

/// Spin up a real broker on an OS-assigned port with temp directories.
pub async fn spawn_broker(remote_url: &str) -> TestBroker {
    let staging = TempDir::new().expect("create staging dir");
    let downloads = TempDir::new().expect("create downloads dir");

    let config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        staging_dir: staging.path().to_path_buf(),
        downloads_dir: downloads.path().to_path_buf(),
        remote_url: remote_url.to_string(),
        remote_token: "test-token".to_string(),
        ..BrokerConfig::default()
    };

    let listener = server::bind(&config).await.expect("bind broker");
    let addr = listener.local_addr().expect("broker addr");
    let state = BrokerState::new(config, Arc::new(NoopCatalog::new())).expect("broker state");
    tokio::spawn(async move {
        let _ = server::run(listener, state).await;
    });

    TestBroker {
        addr,
        staging,
        downloads,
    }
}

//===============
// WebSocket client
//===============

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(url: &str) -> Self {
        let (stream, _) = connect_async(url).await.expect("connect websocket");
        Self { stream }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.stream
            .send(WsMessage::Text(value.to_string()))
            .await
            .expect("send message");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.stream
            .send(WsMessage::Text(text.to_string()))
            .await
            .expect("send message");
    }

    /// Next JSON message from the server, skipping transport frames.
    pub async fn recv_json(&mut self) -> Value {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match self.stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        return serde_json::from_str(&text).expect("server sent invalid JSON")
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => panic!("websocket error: {err}"),
                    None => panic!("connection closed while waiting for event"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Receive until the named event arrives. Unexpected error events fail
    /// the test immediately so mistakes don't show up as timeouts.
    pub async fn recv_event(&mut self, event: &str) -> Value {
        loop {
            let value = self.recv_json().await;
            let got = value["event"].as_str().unwrap_or_default().to_string();
            if got == event {
                return value;
            }
            if got == "error" || got == "download-error" {
                panic!("expected event {event:?}, got {value}");
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

//===============
// Mock downstream store
//===============

#[derive(Debug)]
pub struct ReceivedUpload {
    pub file_id: String,
    pub file_name: String,
    pub file_size: String,
    pub folder_id: Option<String>,
    pub authorization: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

pub type StoreLog = Arc<Mutex<Vec<ReceivedUpload>>>;

/// Stand-in for the downstream store. Returns `{"file_id": "R1"}` on
/// success, or the given status with an empty body when `fail_status` is set.
pub async fn spawn_store(fail_status: Option<u16>) -> (String, StoreLog) {
    let log: StoreLog = Arc::new(Mutex::new(Vec::new()));
    let handler_log = log.clone();

    let app = Router::new().route(
        "/api/upload",
        post(move |headers: HeaderMap, body: axum::body::Bytes| {
            let log = handler_log.clone();
            async move {
                let header = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                };
                log.lock().await.push(ReceivedUpload {
                    file_id: header("x-file-id"),
                    file_name: header("x-file-name"),
                    file_size: header("x-file-size"),
                    folder_id: headers
                        .get("x-folder-id")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                    authorization: header("authorization"),
                    content_type: header("content-type"),
                    body: body.to_vec(),
                });

                match fail_status {
                    Some(status) => StatusCode::from_u16(status).unwrap().into_response(),
                    None => Json(json!({"file_id": "R1"})).into_response(),
                }
            }
        }),
    );

    let addr = serve_router(app).await;
    (format!("http://{addr}/api/upload"), log)
}

//===============
// Mock download origin
//===============

pub type RangeLog = Arc<Mutex<Vec<Option<String>>>>;

/// Origin serving `/file.bin`. Honors `Range: bytes=N-` with a 206 when
/// `support_range` is set; a throttle streams the body in 8 KiB pieces so
/// tests can pause mid-flight.
pub async fn spawn_origin(
    content: Vec<u8>,
    support_range: bool,
    throttle: Option<Duration>,
) -> (String, RangeLog) {
    let ranges: RangeLog = Arc::new(Mutex::new(Vec::new()));
    let handler_ranges = ranges.clone();
    let content = Arc::new(content);

    let app = Router::new().route(
        "/file.bin",
        get(move |headers: HeaderMap| {
            let ranges = handler_ranges.clone();
            let content = content.clone();
            async move {
                let range = headers
                    .get(header::RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                ranges.lock().await.push(range.clone());

                let total = content.len();
                let offset = range
                    .filter(|_| support_range)
                    .and_then(|r| parse_range_start(&r))
                    .map(|n| n.min(total as u64) as usize);

                let (status, start) = match offset {
                    Some(start) => (StatusCode::PARTIAL_CONTENT, start),
                    None => (StatusCode::OK, 0),
                };
                let slice = content[start..].to_vec();

                let mut response = Response::builder()
                    .status(status)
                    .header(header::CONTENT_LENGTH, slice.len());
                if status == StatusCode::PARTIAL_CONTENT {
                    response = response.header(
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{}/{total}", total - 1),
                    );
                }

                let body = match throttle {
                    Some(delay) => {
                        let pieces: Vec<Vec<u8>> =
                            slice.chunks(8 * 1024).map(|c| c.to_vec()).collect();
                        let stream = futures::stream::unfold(
                            pieces.into_iter(),
                            move |mut pieces| async move {
                                let piece = pieces.next()?;
                                tokio::time::sleep(delay).await;
                                Some((Ok::<_, std::io::Error>(piece), pieces))
                            },
                        );
                        Body::from_stream(stream)
                    }
                    None => Body::from(slice),
                };

                response.body(body).unwrap()
            }
        }),
    );

    let addr = serve_router(app).await;
    (format!("http://{addr}/file.bin"), ranges)
}

fn parse_range_start(value: &str) -> Option<u64> {
    value
        .strip_prefix("bytes=")?
        .split('-')
        .next()?
        .parse()
        .ok()
}

async fn serve_router(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock server addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}
