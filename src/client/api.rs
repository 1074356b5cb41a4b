use async_trait::async_trait;
use futures::{ Stream, StreamExt };
use log::{ debug, warn };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE } };
use serde_json::Value as JsonValue;
use std::error::Error as StdError;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{ ClientError, UpstreamError };
use crate::llm::Provider;
use crate::models::chat::{ ConversationThread, InferenceRequest, InferenceResponse };
use crate::models::stream::StreamFrame;
use crate::relay::parser::FrameParser;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame, ClientError>> + Send>>;

/// How a chat session reaches the relay.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &InferenceRequest) -> Result<InferenceResponse, ClientError>;

    async fn send_stream(&self, request: &InferenceRequest) -> Result<FrameStream, ClientError>;

    async fn get_thread(&self, thread_id: &str) -> Result<ConversationThread, ClientError>;
}

/// HTTP client for the relay's `/api` surface.
pub struct ChatApi {
    http: HttpClient,
    base_url: String,
    provider: Provider,
}

impl ChatApi {
    pub fn new(base_url: &str, provider: Provider) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            provider,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if !resp.status().is_success() {
            return Err(UpstreamError::from_response(resp).await.into());
        }
        Ok(resp)
    }

    pub async fn list_threads(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize
    ) -> Result<Vec<ConversationThread>, ClientError> {
        let query = [
            ("user_id", user_id.to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        let resp = self.http
            .get(self.url("/api/threads"))
            .query(&query)
            .send().await
            .map_err(UpstreamError::from)?;
        let body: JsonValue = Self::checked(resp).await?.json().await.map_err(UpstreamError::from)?;

        // The upstream answers either with a bare array or with `{threads: [...]}`.
        let items = match body {
            JsonValue::Array(items) => items,
            JsonValue::Object(mut obj) =>
                match obj.remove("threads") {
                    Some(JsonValue::Array(items)) => items,
                    _ => Vec::new(),
                }
            _ => Vec::new(),
        };
        Ok(
            items
                .into_iter()
                .filter_map(|item| serde_json::from_value::<ConversationThread>(item).ok())
                .collect()
        )
    }

    pub async fn delete_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<(), ClientError> {
        let mut builder = self.http.delete(self.url(&format!("/api/threads/{}", thread_id)));
        if let Some(user_id) = user_id {
            builder = builder.query(&[("user_id", user_id)]);
        }
        let resp = builder.send().await.map_err(UpstreamError::from)?;
        Self::checked(resp).await?;
        Ok(())
    }

    pub async fn health(&self) -> Result<bool, ClientError> {
        let resp = self.http.get(self.url("/api/soulgraph/health")).send().await.map_err(UpstreamError::from)?;
        Ok(resp.status().is_success())
    }
}

#[async_trait]
impl ChatTransport for ChatApi {
    async fn send(&self, request: &InferenceRequest) -> Result<InferenceResponse, ClientError> {
        let resp = self.http
            .post(self.url(self.provider.route()))
            .json(&request.streaming(false))
            .send().await
            .map_err(UpstreamError::from)?;
        let response = Self::checked(resp).await?.json::<InferenceResponse>().await.map_err(UpstreamError::from)?;
        Ok(response)
    }

    async fn send_stream(&self, request: &InferenceRequest) -> Result<FrameStream, ClientError> {
        let resp = self.http
            .post(self.url(self.provider.route()))
            .json(&request.streaming(true))
            .send().await
            .map_err(UpstreamError::from)?;
        let resp = Self::checked(resp).await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut parser = FrameParser::new();
            let mut stream = resp.bytes_stream();

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(ClientError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                for frame in parser.feed(&chunk) {
                    match frame {
                        Ok(frame) => {
                            if tx.send(Ok(frame)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Skipping stream event: {}", e),
                    }
                }
            }
            for frame in parser.finish().into_iter().flatten() {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            debug!("Relay stream ended");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn get_thread(&self, thread_id: &str) -> Result<ConversationThread, ClientError> {
        let resp = self.http
            .get(self.url(&format!("/api/threads/{}", thread_id)))
            .send().await
            .map_err(UpstreamError::from)?;
        let thread = Self::checked(resp).await?.json().await.map_err(UpstreamError::from)?;
        Ok(thread)
    }
}
