//! HTTP client for the modelhost controller API

use anyhow::{anyhow, Context, Result};
use modelhost_core::{
    Event, GpuSnapshot, LaunchSession, LifetimeMetrics, MetricsSnapshot, PeakMetrics, Recipe,
    RecipeId, StatusSnapshot,
};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Body of `GET /wait-ready`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitReady {
    pub ready: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of `GET /events/stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStats {
    pub subscribers: usize,
    pub published: u64,
    pub dropped: u64,
    pub snapshot_categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    cancelled: bool,
}

#[derive(Debug, Deserialize)]
struct EvictBody {
    evicted: bool,
}

/// Client for the controller's HTTP API
#[derive(Clone)]
pub struct ModelhostClient {
    endpoint: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl ModelhostClient {
    /// `timeout` bounds every request except the event stream
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        timeout: Duration,
    ) -> Result<T> {
        debug!("{} {}", method, path);
        let response = self
            .http
            .request(method, self.url(path))
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("Failed to reach controller at {}", self.endpoint))?;

        let response = check_status(response).await?;
        response
            .json()
            .await
            .with_context(|| format!("Invalid response from {}", path))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.call(Method::GET, path, self.timeout).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.call(Method::POST, path, self.timeout).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        self.get("/status").await
    }

    pub async fn gpus(&self) -> Result<Vec<GpuSnapshot>> {
        self.get("/gpus").await
    }

    /// `None` when no engine is running
    pub async fn metrics(&self) -> Result<Option<MetricsSnapshot>> {
        self.get("/metrics").await
    }

    pub async fn peak_metrics(&self) -> Result<PeakMetrics> {
        self.get("/peak-metrics").await
    }

    pub async fn lifetime_metrics(&self) -> Result<LifetimeMetrics> {
        self.get("/lifetime-metrics").await
    }

    pub async fn recipes(&self) -> Result<Vec<Recipe>> {
        self.get("/recipes").await
    }

    pub async fn current_launch(&self) -> Result<Option<LaunchSession>> {
        self.get("/launch").await
    }

    pub async fn launch(&self, recipe: &RecipeId) -> Result<LaunchSession> {
        self.post(&format!("/launch/{}", recipe)).await
    }

    pub async fn cancel(&self, recipe: &RecipeId) -> Result<bool> {
        let body: CancelBody = self.post(&format!("/launch/{}/cancel", recipe)).await?;
        Ok(body.cancelled)
    }

    pub async fn evict(&self) -> Result<bool> {
        let body: EvictBody = self.post("/evict").await?;
        Ok(body.evicted)
    }

    /// Blocks server-side for up to `wait`
    pub async fn wait_ready(&self, wait: Option<Duration>) -> Result<WaitReady> {
        match wait {
            Some(wait) => {
                let path = format!("/wait-ready?timeout={}", wait.as_secs());
                self.call(Method::GET, &path, wait + self.timeout).await
            }
            // The server default may exceed our own timeout
            None => self.call(Method::GET, "/wait-ready", Duration::from_secs(3600)).await,
        }
    }

    pub async fn event_stats(&self) -> Result<EventStats> {
        self.get("/events/stats").await
    }

    /// Open the server-sent event stream
    pub async fn events(&self) -> Result<EventStream> {
        let response = self
            .http
            .get(self.url("/events"))
            .header("accept", "text/event-stream")
            .send()
            .await
            .with_context(|| format!("Failed to open event stream at {}", self.endpoint))?;
        let response = check_status(response).await?;
        Ok(EventStream::new(response))
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(anyhow!(
            "{} ({}): {}",
            status,
            body.category.as_deref().unwrap_or("error"),
            body.error
        )),
        Err(_) => Err(anyhow!("{}: {}", status, text.trim())),
    }
}

/// One raw SSE frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn into_event(self) -> modelhost_core::Result<Event> {
        let name = self.event.as_deref().unwrap_or("message");
        Event::from_wire(name, self.id.as_deref(), &self.data)
    }
}

/// Largest frame the decoder holds before giving up on the stream
pub const MAX_FRAME_BYTES: usize = 4 << 20;

/// Incremental `text/event-stream` parser
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes after the last newline
    buffer: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    /// Bytes held in `data`
    pending: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every frame they complete
    ///
    /// Fails once an unfinished frame grows past [`MAX_FRAME_BYTES`].
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        // Only the new bytes can hold a newline
        let mut from = self.buffer.len();
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            let line = String::from_utf8_lossy(&buffer[start..end]);
            if let Some(frame) = self.line(line.trim_end_matches('\r')) {
                frames.push(frame);
            }
            start = end + 1;
            from = start;
        }
        buffer.drain(..start);
        self.buffer = buffer;

        let held = self.buffer.len() + self.pending;
        if held > MAX_FRAME_BYTES {
            return Err(anyhow!(
                "event stream frame exceeds {} bytes ({} buffered)",
                MAX_FRAME_BYTES,
                held
            ));
        }
        Ok(frames)
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comment, used for keep-alive
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "data" => {
                self.pending += value.len() + 1;
                self.data.push(value.to_string());
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        self.pending = 0;
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, id, data })
    }
}

/// Live events decoded from `GET /events`
pub struct EventStream {
    response: Response,
    decoder: SseDecoder,
    ready: VecDeque<Event>,
}

impl EventStream {
    fn new(response: Response) -> Self {
        Self {
            response,
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
        }
    }

    /// Next event; `Ok(None)` once the server closes the stream
    pub async fn next(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }

            let Some(chunk) = self.response.chunk().await? else {
                return Ok(None);
            };
            for frame in self.decoder.push(&chunk)? {
                match frame.into_event() {
                    Ok(event) => self.ready.push_back(event),
                    Err(e) => warn!("Skipping undecodable event: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::sse::{Event as SseEvent, Sse};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use modelhost_core::{EventCategory, EventPayload, LaunchStage, LogLine, LogStream};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    /// Serve `router` on an ephemeral port
    pub(crate) async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    pub(crate) fn client(addr: SocketAddr) -> ModelhostClient {
        ModelhostClient::new(&format!("http://{}/", addr), Duration::from_secs(5)).unwrap()
    }

    pub(crate) fn sse_frame(event: &Event) -> SseEvent {
        SseEvent::default()
            .event(event.category().as_str())
            .id(event.seq.to_string())
            .json_data(event.to_wire().unwrap())
            .unwrap()
    }

    fn log_event(seq: u64, line: &str) -> Event {
        Event::new(
            seq,
            EventPayload::Log(LogLine {
                pid: 7,
                stream: LogStream::Stdout,
                line: line.to_string(),
            }),
        )
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let event = log_event(3, "loading weights");
        let data = serde_json::to_string(&event.to_wire().unwrap()).unwrap();
        let text = format!(": keep-alive\n\nevent: log\nid: 3\ndata: {}\n\n", data);
        let bytes = text.as_bytes();

        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        for piece in bytes.chunks(7) {
            frames.extend(decoder.push(piece).unwrap());
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("log"));
        assert_eq!(frames[0].id.as_deref(), Some("3"));
        let decoded = frames.remove(0).into_event().unwrap();
        assert_eq!(decoded.seq, 3);
        assert_eq!(decoded.payload, event.payload);
    }

    #[test]
    fn test_decoder_crlf_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder
            .push(b"event: x\r\ndata: a\r\ndata:b\r\n\r\nid: 9\r\n\r\n")
            .unwrap();
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("x".to_string()),
                id: None,
                data: "a\nb".to_string(),
            }]
        );
        // A frame without data is not dispatched, and its fields do not leak
        assert!(decoder.push(b"data: c\n\n").unwrap()[0].id.is_none());
    }

    #[test]
    fn test_decoder_rejects_unterminated_flood() {
        let mut decoder = SseDecoder::new();
        let block = vec![b'x'; 64 * 1024];

        let mut pushed = 0;
        let err = loop {
            match decoder.push(&block) {
                Ok(frames) => assert!(frames.is_empty()),
                Err(e) => break e,
            }
            pushed += block.len();
            assert!(pushed <= MAX_FRAME_BYTES, "no newline for {} bytes", pushed);
        };
        assert!(err.to_string().contains("exceeds"), "{}", err);

        // Many data lines of one frame count against the same limit
        let mut decoder = SseDecoder::new();
        let line = format!("data: {}\n", "y".repeat(64 * 1024));
        let failed = (0..MAX_FRAME_BYTES / (64 * 1024) + 2)
            .any(|_| decoder.push(line.as_bytes()).is_err());
        assert!(failed);
    }

    #[test]
    fn test_decoder_many_frames_in_one_chunk() {
        let text = "data: a\n\n".repeat(10_000);
        let frames = SseDecoder::new().push(text.as_bytes()).unwrap();
        assert_eq!(frames.len(), 10_000);
        assert!(frames.iter().all(|f| f.data == "a"));
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let router = Router::new().route(
            "/launch/:id",
            post(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(serde_json::json!({"error": "Recipe not found: nope", "category": "not_found"})),
                )
                    .into_response()
            }),
        );
        let addr = serve(router).await;

        let err = client(addr)
            .launch(&RecipeId::new("nope"))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("404"), "{}", err);
        assert!(err.contains("not_found"), "{}", err);
        assert!(err.contains("Recipe not found: nope"), "{}", err);
    }

    #[tokio::test]
    async fn test_null_bodies_decode_as_none() {
        let router = Router::new()
            .route("/metrics", get(|| async { Json(serde_json::Value::Null) }))
            .route("/launch", get(|| async { Json(serde_json::Value::Null) }))
            .route(
                "/launch/:id/cancel",
                post(|| async { Json(serde_json::json!({"cancelled": true})) }),
            );
        let addr = serve(router).await;
        let client = client(addr);

        assert_eq!(client.metrics().await.unwrap(), None);
        assert_eq!(client.current_launch().await.unwrap(), None);
        assert!(client.cancel(&RecipeId::new("a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_event_stream_decodes_frames() {
        let mut session = LaunchSession::new(RecipeId::new("a"));
        session.advance(LaunchStage::Ready, "Serving a on port 8001");
        let events = vec![
            Event::new(1, EventPayload::Status(StatusSnapshot::default())),
            Event::new(2, EventPayload::LaunchProgress(session)),
        ];
        let served = events.clone();
        let router = Router::new().route(
            "/events",
            get(move || {
                let frames: Vec<SseEvent> = served.iter().map(sse_frame).collect();
                async move {
                    Sse::new(futures::stream::iter(
                        frames.into_iter().map(Ok::<_, Infallible>),
                    ))
                }
            }),
        );
        let addr = serve(router).await;

        let mut stream = client(addr).events().await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.category(), EventCategory::Status);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.payload, events[1].payload);
        assert!(stream.next().await.unwrap().is_none());
    }
}
