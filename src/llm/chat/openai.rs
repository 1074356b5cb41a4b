use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::{ debug, info, warn };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;
use std::time::Duration;

use super::{ create_streaming_response, ByteStream, InferenceBackend, DEFAULT_SYSTEM_PROMPT };
use crate::error::UpstreamError;
use crate::llm::Provider;
use crate::models::chat::{ InferenceRequest, InferenceResponse };
use crate::models::stream::StreamFrame;
use crate::relay::parser::SseDecoder;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

const DONE_SENTINEL: &str = "[DONE]";

/// Chat completions client. It has no thread store, so ids are taken from the
/// request or synthesized.
pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
    default_system_prompt: String,
    timeout: Duration,
}

#[derive(Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIDelta,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

impl OpenAIChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        default_system_prompt: Option<String>,
        timeout: Duration
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                format!("Invalid API key format: {}", e)
            )?
        );

        let http = HttpClient::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)?;

        Ok(Self {
            http,
            model: model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            default_system_prompt: default_system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            timeout,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, request: &InferenceRequest, stream: bool) -> OpenAIChatRequest {
        let system_prompt = request.system_prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.default_system_prompt.clone());

        OpenAIChatRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            messages: vec![
                OpenAIMessage { role: "system".to_string(), content: system_prompt },
                OpenAIMessage { role: "user".to_string(), content: request.message.clone() }
            ],
            stream: if stream { Some(true) } else { None },
        }
    }

    fn thread_id_for(request: &InferenceRequest) -> String {
        request.thread_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Provider::OpenAI.synthesize_thread_id())
    }
}

/// Pulls the text deltas out of one OpenAI stream payload.
fn deltas(data: &str) -> Vec<String> {
    if data == DONE_SENTINEL {
        return Vec::new();
    }
    match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(resp) =>
            resp.choices
                .into_iter()
                .filter_map(|choice| choice.delta.content)
                .filter(|content| !content.is_empty())
                .collect(),
        Err(e) => {
            debug!("Skipping OpenAI payload ({}): {}", e, data);
            Vec::new()
        }
    }
}

#[async_trait]
impl InferenceBackend for OpenAIChatClient {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, UpstreamError> {
        let thread_id = Self::thread_id_for(request);
        let req = self.build_request(request, false);

        let resp = self.http.post(self.completions_url()).timeout(self.timeout).json(&req).send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::from_response(resp).await);
        }
        let body = resp.json::<OpenAIResponse>().await?;

        let response = body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();

        info!("OpenAI answered {} chars on thread {}", response.len(), thread_id);
        Ok(InferenceResponse { response, thread_id })
    }

    async fn infer_stream(&self, request: &InferenceRequest) -> Result<ByteStream, UpstreamError> {
        let thread_id = Self::thread_id_for(request);
        let req = self.build_request(request, true);

        let resp = self.http.post(self.completions_url()).json(&req).send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::from_response(resp).await);
        }

        Ok(
            create_streaming_response(move |tx| async move {
                let frame = |f: StreamFrame| Ok(Bytes::from(f.to_sse()));

                if tx.send(frame(StreamFrame::ThreadId(thread_id))).await.is_err() {
                    return;
                }

                let mut decoder = SseDecoder::new();
                let mut stream = resp.bytes_stream();

                while let Some(chunk_result) = stream.next().await {
                    let chunk = match chunk_result {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!("OpenAI stream interrupted: {}", e);
                            let _ = tx.send(Err(UpstreamError::from(e))).await;
                            return;
                        }
                    };
                    for payload in decoder.feed(&chunk) {
                        let data = match payload {
                            Ok(data) => data,
                            Err(e) => {
                                debug!("Skipping OpenAI event: {}", e);
                                continue;
                            }
                        };
                        for content in deltas(&data) {
                            if tx.send(frame(StreamFrame::Chunk(content))).await.is_err() {
                                return;
                            }
                        }
                    }
                }

                for data in decoder.finish().into_iter().flatten() {
                    for content in deltas(&data) {
                        if tx.send(frame(StreamFrame::Chunk(content))).await.is_err() {
                            return;
                        }
                    }
                }

                let _ = tx.send(frame(StreamFrame::Done)).await;
            })
        )
    }
}
