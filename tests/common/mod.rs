#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::TimeZone;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use tracking_webhooks::{
    Backoff, Carrier, JobHandler, JobQueue, QueueCounts, QueueName, QueuePolicies, QueuePolicy,
    RepeatSchedule, Result, TrackEvent, TrackEventStatusCode, TrackInfo, WebhookError,
};

/// Deterministic timeline with `n` events.
pub fn timeline(n: usize) -> TrackInfo {
    let base = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let events = (0..n)
        .map(|i| {
            let mut event = TrackEvent::new(if i + 1 == n {
                TrackEventStatusCode::InTransit
            } else {
                TrackEventStatusCode::InformationReceived
            });
            event.time = Some(base + chrono::Duration::hours(i as i64));
            event.description = Some(format!("scan {i}"));
            event
        })
        .collect();
    TrackInfo::new(events)
}

/// Carrier stub that replays a script of results, then repeats the
/// last one forever.
pub struct ScriptedCarrier {
    script: Mutex<VecDeque<std::result::Result<TrackInfo, String>>>,
    last: Mutex<Option<std::result::Result<TrackInfo, String>>>,
    calls: AtomicU32,
}

impl ScriptedCarrier {
    pub fn new(script: Vec<std::result::Result<TrackInfo, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicU32::new(0),
        })
    }

    pub fn returning(info: TrackInfo) -> Arc<Self> {
        Self::new(vec![Ok(info)])
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Self::new(vec![Err(message.to_string())])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Carrier for ScriptedCarrier {
    async fn track(&self, _tracking_number: &str) -> Result<TrackInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut script = self.script.lock().await;
            script.pop_front()
        };
        let result = match next {
            Some(result) => {
                *self.last.lock().await = Some(result.clone());
                result
            }
            None => self
                .last
                .lock()
                .await
                .clone()
                .expect("scripted carrier called with empty script"),
        };
        result.map_err(WebhookError::CarrierFailure)
    }
}

/// One scripted HTTP response.
#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub body: String,
}

pub fn resp(status: u16) -> StubResponse {
    StubResponse {
        status,
        body: "ok".to_string(),
    }
}

/// A request as received by the stub endpoint.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub at: Instant,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("request body is JSON")
    }
}

/// Minimal local HTTP endpoint replaying a response script; requests
/// after the script are answered 200.
pub struct HookServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl HookServer {
    pub async fn start(script: Vec<StubResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<ReceivedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(VecDeque::from(script)));

        let accept_requests = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let requests = accept_requests.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, requests, script).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path)
    }

    pub async fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

async fn serve_one(
    mut stream: tokio::net::TcpStream,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    script: Arc<Mutex<VecDeque<StubResponse>>>,
) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
    };

    let header_text = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let headers: Vec<(String, String)> = header_text
        .lines()
        .skip(1)
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);

    let body_start = header_end + 4;
    while buffer.len() < body_start + content_length {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    let body = String::from_utf8_lossy(&buffer[body_start..]).to_string();

    requests.lock().await.push(ReceivedRequest {
        headers,
        body,
        at: Instant::now(),
    });

    let response = {
        let mut script = script.lock().await;
        script.pop_front().unwrap_or_else(|| resp(200))
    };
    let raw = format!(
        "HTTP/1.1 {} Status\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        response.body.len(),
        response.body
    );
    stream.write_all(raw.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Queue policies scaled down so integration tests run in real time.
pub fn fast_policies() -> QueuePolicies {
    QueuePolicies {
        monitor: QueuePolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(50),
            },
            jitter: Duration::ZERO,
        },
        delivery: QueuePolicy {
            max_attempts: 4,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(50),
            },
            jitter: Duration::ZERO,
        },
        cleanup: QueuePolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(100)),
            jitter: Duration::ZERO,
        },
    }
}

/// Queue stub that records operations instead of executing them; lets
/// tests assert exactly what a worker scheduled.
#[derive(Default)]
pub struct RecordingQueue {
    pub enqueued: Mutex<Vec<(QueueName, String, serde_json::Value)>>,
    pub repeating: Mutex<Vec<(QueueName, String)>>,
    pub removed: Mutex<Vec<(QueueName, String)>>,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn enqueued_for(&self, queue: QueueName) -> Vec<serde_json::Value> {
        self.enqueued
            .lock()
            .await
            .iter()
            .filter(|(name, _, _)| *name == queue)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }

    pub async fn removed_ids(&self, queue: QueueName) -> Vec<String> {
        self.removed
            .lock()
            .await
            .iter()
            .filter(|(name, _)| *name == queue)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.enqueued
            .lock()
            .await
            .push((queue, job_id.to_string(), payload));
        Ok(())
    }

    async fn add_repeating(
        &self,
        queue: QueueName,
        job_id: &str,
        _payload: serde_json::Value,
        _schedule: RepeatSchedule,
    ) -> Result<()> {
        self.repeating.lock().await.push((queue, job_id.to_string()));
        Ok(())
    }

    async fn remove_scheduled(&self, queue: QueueName, job_id: &str) -> Result<()> {
        self.removed.lock().await.push((queue, job_id.to_string()));
        Ok(())
    }

    async fn counts(&self, _queue: QueueName) -> Result<QueueCounts> {
        Ok(QueueCounts::default())
    }

    async fn process(&self, _queue: QueueName, _handler: Arc<dyn JobHandler>) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Poll an async condition until it holds or the deadline passes.
macro_rules! wait_until {
    ($what:expr, $deadline_ms:expr, $cond:expr) => {{
        let deadline =
            std::time::Instant::now() + std::time::Duration::from_millis($deadline_ms);
        loop {
            if $cond {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", $what);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }};
}
pub(crate) use wait_until;
