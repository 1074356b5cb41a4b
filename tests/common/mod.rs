//! Shared fakes and mock servers for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ Path, State },
    http::{ header, StatusCode },
    response::{ IntoResponse, Response },
    routing::{ get, post },
    Json,
    Router,
};
use bytes::Bytes;
use futures::stream;
use serde_json::{ json, Value as JsonValue };
use soulchat::client::{ ChatTransport, FrameStream };
use soulchat::error::{ ClientError, MirrorError, UpstreamError };
use soulchat::history::{ MemoryMirror, ThreadMirror };
use soulchat::llm::chat::{ ByteStream, InferenceBackend, ThreadBackend };
use soulchat::llm::Provider;
use soulchat::models::chat::{ ChatMessage, ConversationThread, InferenceRequest, InferenceResponse, MirrorRow, Role };
use soulchat::models::stream::StreamFrame;
use soulchat::server::{ api::router, AppState };
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::{ Arc, Mutex };
use tokio::sync::RwLock;

// ============================================================================
// Scenario data
// ============================================================================

pub const SCENARIO_STREAM: &str = concat!(
    "data: {\"thread_id\":\"t1\"}\n\n",
    "data: {\"chunk\":\"Hi\"}\n\n",
    "data: {\"chunk\":\" there\"}\n\n",
    "data: {\"done\":true}\n\n"
);

/// The scenario stream cut at awkward places, including inside a JSON value.
pub fn scenario_chunks() -> Vec<Bytes> {
    let bytes = SCENARIO_STREAM.as_bytes();
    [0, 7, 26, 27, 40, 41, 60, 75, bytes.len()]
        .windows(2)
        .map(|w| Bytes::copy_from_slice(&bytes[w[0]..w[1]]))
        .collect()
}

pub fn scenario_thread() -> ConversationThread {
    let mut thread = ConversationThread::new("t1");
    thread.messages = vec![
        ChatMessage::new(Role::System, "You are a helpful assistant."),
        ChatMessage::user("Hello"),
        ChatMessage::assistant("Hi there")
    ];
    thread
}

// ============================================================================
// In-process SoulGraph fake
// ============================================================================

pub struct FakeSoulGraph {
    pub chunks: Vec<Bytes>,
    pub thread: ConversationThread,
    pub fail_with: Option<UpstreamError>,
    pub requests: Mutex<Vec<InferenceRequest>>,
    pub thread_reads: AtomicUsize,
}

impl FakeSoulGraph {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks,
            thread: scenario_thread(),
            fail_with: None,
            requests: Mutex::new(Vec::new()),
            thread_reads: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: UpstreamError) -> Self {
        Self { fail_with: Some(err), ..Self::new(Vec::new()) }
    }

    fn check(&self) -> Result<(), UpstreamError> {
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InferenceBackend for FakeSoulGraph {
    fn provider(&self) -> Provider {
        Provider::SoulGraph
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, UpstreamError> {
        self.requests.lock().unwrap().push(request.clone());
        self.check()?;
        Ok(InferenceResponse { response: "Hi there".into(), thread_id: "t1".into() })
    }

    async fn infer_stream(&self, request: &InferenceRequest) -> Result<ByteStream, UpstreamError> {
        self.requests.lock().unwrap().push(request.clone());
        self.check()?;
        let items: Vec<Result<Bytes, UpstreamError>> = self.chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

#[async_trait]
impl ThreadBackend for FakeSoulGraph {
    async fn get_thread(&self, thread_id: &str) -> Result<ConversationThread, UpstreamError> {
        self.thread_reads.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if thread_id != self.thread.id {
            return Err(UpstreamError::status(404, "Thread not found"));
        }
        Ok(self.thread.clone())
    }

    async fn list_threads(&self, user_id: &str, limit: usize, offset: usize) -> Result<JsonValue, UpstreamError> {
        self.check()?;
        Ok(json!({ "threads": [self.thread], "user_id": user_id, "limit": limit, "offset": offset }))
    }

    async fn delete_thread(&self, thread_id: &str, _user_id: Option<&str>) -> Result<JsonValue, UpstreamError> {
        self.check()?;
        Ok(json!({ "deleted": thread_id }))
    }

    async fn health(&self) -> Result<(), UpstreamError> {
        self.check()
    }
}

// ============================================================================
// Mirror that counts writes
// ============================================================================

#[derive(Default)]
pub struct CountingMirror {
    pub inner: MemoryMirror,
    pub upserts: AtomicUsize,
}

impl CountingMirror {
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThreadMirror for CountingMirror {
    async fn upsert(&self, row: &MirrorRow) -> Result<(), MirrorError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(row).await
    }

    async fn delete(&self, thread_id: &str) -> Result<(), MirrorError> {
        self.inner.delete(thread_id).await
    }

    async fn get(&self, thread_id: &str) -> Result<Option<MirrorRow>, MirrorError> {
        self.inner.get(thread_id).await
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<MirrorRow>, MirrorError> {
        self.inner.list(user_id).await
    }
}

/// Waits for the fire-and-forget reconciler to land a row.
pub async fn wait_for_row(mirror: &dyn ThreadMirror, id: &str) -> Option<MirrorRow> {
    for _ in 0..50 {
        if let Ok(Some(row)) = mirror.get(id).await {
            return Some(row);
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    None
}

// ============================================================================
// Scripted chat transport
// ============================================================================

pub enum StreamScript {
    Refuse,
    Frames(Vec<StreamFrame>),
    FramesThenBreak(Vec<StreamFrame>),
}

pub enum SendScript {
    Reply(&'static str, &'static str),
    Fail(u16),
}

#[derive(Default)]
pub struct FakeTransport {
    pub streams: Mutex<VecDeque<StreamScript>>,
    pub sends: Mutex<VecDeque<SendScript>>,
    pub stream_requests: Mutex<Vec<InferenceRequest>>,
    pub send_requests: Mutex<Vec<InferenceRequest>>,
    pub thread: Mutex<Option<ConversationThread>>,
    pub thread_reads: AtomicUsize,
}

impl FakeTransport {
    pub fn with(streams: Vec<StreamScript>, sends: Vec<SendScript>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
            sends: Mutex::new(sends.into()),
            ..Default::default()
        }
    }

    pub fn send_calls(&self) -> Vec<InferenceRequest> {
        self.send_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send(&self, request: &InferenceRequest) -> Result<InferenceResponse, ClientError> {
        self.send_requests.lock().unwrap().push(request.clone());
        match self.sends.lock().unwrap().pop_front() {
            Some(SendScript::Reply(text, id)) => Ok(InferenceResponse { response: text.into(), thread_id: id.into() }),
            Some(SendScript::Fail(code)) => Err(UpstreamError::status(code, "upstream failed").into()),
            None => Err(ClientError::Stream("no scripted reply".into())),
        }
    }

    async fn send_stream(&self, request: &InferenceRequest) -> Result<FrameStream, ClientError> {
        self.stream_requests.lock().unwrap().push(request.clone());
        let script = self.streams.lock().unwrap().pop_front().unwrap_or(StreamScript::Refuse);
        let items: Vec<Result<StreamFrame, ClientError>> = match script {
            StreamScript::Refuse => {
                return Err(UpstreamError::status(502, "stream refused").into());
            }
            StreamScript::Frames(frames) => frames.into_iter().map(Ok).collect(),
            StreamScript::FramesThenBreak(frames) => {
                let mut items: Vec<_> = frames.into_iter().map(Ok).collect();
                items.push(Err(ClientError::Stream("connection reset".into())));
                items
            }
        };
        Ok(Box::pin(stream::iter(items)))
    }

    async fn get_thread(&self, thread_id: &str) -> Result<ConversationThread, ClientError> {
        self.thread_reads.fetch_add(1, Ordering::SeqCst);
        match self.thread.lock().unwrap().clone() {
            Some(thread) if thread.id == thread_id => Ok(thread),
            _ => Err(UpstreamError::status(404, "Thread not found").into()),
        }
    }
}

// ============================================================================
// Mock SoulGraph HTTP server
// ============================================================================

#[derive(Default)]
pub struct MockUpstreamState {
    pub requests: RwLock<Vec<JsonValue>>,
    pub thread_reads: AtomicUsize,
}

pub async fn start_mock_soulgraph() -> (String, Arc<MockUpstreamState>) {
    let state = Arc::new(MockUpstreamState::default());

    let app = Router::new()
        .route("/v0/inference", post(mock_inference))
        .route("/v0/threads/{thread_id}", get(mock_get_thread).delete(mock_delete_thread))
        .route("/v0/health", get(|| async { Json(json!({ "status": "healthy" })) }))
        .with_state(state.clone());

    let addr = serve(app).await;
    (format!("http://{}", addr), state)
}

/// An upstream that answers health and delete with plain text.
pub async fn start_plain_text_soulgraph() -> String {
    let app = Router::new()
        .route("/v0/health", get(|| async { "OK" }))
        .route("/v0/threads/{thread_id}", axum::routing::delete(|| async { "Deleted" }));
    let addr = serve(app).await;
    format!("http://{}", addr)
}

/// Serves the relay router on an ephemeral port.
pub async fn start_relay(state: AppState) -> String {
    let addr = serve(router(state)).await;
    format!("http://{}", addr)
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn mock_inference(State(state): State<Arc<MockUpstreamState>>, Json(body): Json<JsonValue>) -> Response {
    let streaming = body.get("stream").and_then(JsonValue::as_bool).unwrap_or(false);
    state.requests.write().await.push(body);

    if streaming {
        let chunks: Vec<Result<Bytes, std::io::Error>> = scenario_chunks().into_iter().map(Ok).collect();
        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(stream::iter(chunks)))
            .unwrap();
    }
    Json(json!({ "response": "Hi there", "thread_id": "t1" })).into_response()
}

async fn mock_get_thread(State(state): State<Arc<MockUpstreamState>>, Path(thread_id): Path<String>) -> Response {
    state.thread_reads.fetch_add(1, Ordering::SeqCst);
    if thread_id != "t1" {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "Thread not found" }))).into_response();
    }
    let thread = scenario_thread();
    Json(
        json!({
            "thread_id": thread.id,
            "user_id": "test-user-123",
            "messages": thread.messages,
            "created_at": thread.created_at,
            "updated_at": thread.updated_at,
        })
    ).into_response()
}

async fn mock_delete_thread(Path(thread_id): Path<String>) -> Response {
    Json(json!({ "success": true, "thread_id": thread_id })).into_response()
}
