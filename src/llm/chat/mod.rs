pub mod openai;
pub mod soulgraph;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{ Future, Stream, StreamExt };
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::UpstreamError;
use crate::llm::Provider;
use crate::models::chat::{ ConversationThread, InferenceRequest, InferenceResponse };

pub use self::openai::OpenAIChatClient;
pub use self::soulgraph::SoulGraphClient;

/// Raw upstream body, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// A service that answers chat messages, either in one piece or as an SSE
/// byte stream of `thread_id`/`chunk`/`done`/`error` events.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn provider(&self) -> Provider;

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, UpstreamError>;

    async fn infer_stream(&self, request: &InferenceRequest) -> Result<ByteStream, UpstreamError>;
}

/// The system of record for conversation threads.
#[async_trait]
pub trait ThreadBackend: Send + Sync {
    async fn get_thread(&self, thread_id: &str) -> Result<ConversationThread, UpstreamError>;

    async fn list_threads(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize
    ) -> Result<serde_json::Value, UpstreamError>;

    async fn delete_thread(
        &self,
        thread_id: &str,
        user_id: Option<&str>
    ) -> Result<serde_json::Value, UpstreamError>;

    async fn health(&self) -> Result<(), UpstreamError>;
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> ByteStream
    where
        F: FnOnce(mpsc::Sender<Result<Bytes, UpstreamError>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Adapts a `reqwest` body into a [`ByteStream`], tagging transport errors.
pub fn response_byte_stream(resp: reqwest::Response) -> ByteStream {
    Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(UpstreamError::from)))
}
