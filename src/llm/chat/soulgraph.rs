use async_trait::async_trait;
use log::{ debug, info };
use reqwest::{ Client as HttpClient, RequestBuilder, header::{ AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue } };
use serde_json::Value as JsonValue;
use std::error::Error as StdError;
use std::time::Duration;

use super::{ response_byte_stream, ByteStream, InferenceBackend, ThreadBackend };
use crate::auth::TokenSource;
use crate::error::UpstreamError;
use crate::llm::Provider;
use crate::models::chat::{ ConversationThread, InferenceRequest, InferenceResponse };

pub const DEFAULT_API_PREFIX: &str = "/v0";

/// HTTP client for the SoulGraph inference and thread API.
pub struct SoulGraphClient {
    http: HttpClient,
    base_url: String,
    timeout: Duration,
    token: Option<TokenSource>,
}

impl SoulGraphClient {
    pub fn new(
        api_url: &str,
        api_prefix: Option<&str>,
        timeout: Duration,
        token: Option<TokenSource>
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // No client-wide timeout: it would also cap the body of a long stream.
        let http = HttpClient::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)?;

        let prefix = api_prefix.unwrap_or(DEFAULT_API_PREFIX).trim_matches('/');
        let root = api_url.trim_end_matches('/');
        let base_url = if prefix.is_empty() { root.to_string() } else { format!("{}/{}", root, prefix) };

        Ok(Self {
            http,
            base_url,
            timeout,
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, token.bearer()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, UpstreamError> {
        let resp = self.authorize(builder).send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::from_response(resp).await);
        }
        Ok(resp)
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<JsonValue, UpstreamError> {
        let resp = self.send(builder.timeout(self.timeout)).await?;
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl InferenceBackend for SoulGraphClient {
    fn provider(&self) -> Provider {
        Provider::SoulGraph
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, UpstreamError> {
        let body = request.streaming(false);
        let value = self.send_json(self.http.post(self.url("inference")).json(&body)).await?;
        let response = serde_json::from_value::<InferenceResponse>(value)?;
        info!("SoulGraph answered on thread {}", response.thread_id);
        Ok(response)
    }

    async fn infer_stream(&self, request: &InferenceRequest) -> Result<ByteStream, UpstreamError> {
        let body = request.streaming(true);
        let resp = self.send(self.http.post(self.url("inference")).json(&body)).await?;
        debug!("SoulGraph stream opened ({})", resp.status());
        Ok(response_byte_stream(resp))
    }
}

#[async_trait]
impl ThreadBackend for SoulGraphClient {
    async fn get_thread(&self, thread_id: &str) -> Result<ConversationThread, UpstreamError> {
        let mut value = self.send_json(self.http.get(self.url(&format!("threads/{}", thread_id)))).await?;
        if let Some(obj) = value.as_object_mut() {
            if !obj.contains_key("id") {
                let id = obj
                    .remove("thread_id")
                    .unwrap_or_else(|| JsonValue::String(thread_id.to_string()));
                obj.insert("id".to_string(), id);
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn list_threads(&self, user_id: &str, limit: usize, offset: usize) -> Result<JsonValue, UpstreamError> {
        let query = [
            ("user_id", user_id.to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        self.send_json(self.http.get(self.url("threads")).query(&query)).await
    }

    async fn delete_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<JsonValue, UpstreamError> {
        let mut builder = self.http.delete(self.url(&format!("threads/{}", thread_id)));
        if let Some(user_id) = user_id {
            builder = builder.query(&[("user_id", user_id)]);
        }
        // Success is the status; some deployments answer with plain text.
        let resp = self.send(builder.timeout(self.timeout)).await?;
        let body = resp.text().await.unwrap_or_default();
        Ok(serde_json::from_str(&body).unwrap_or(JsonValue::Null))
    }

    async fn health(&self) -> Result<(), UpstreamError> {
        self.send(self.http.get(self.url("health")).timeout(self.timeout)).await.map(|_| ())
    }
}
