use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Timeout,
    HttpStatus(u16),
    Network,
    Unknown,
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamErrorKind::Timeout => write!(f, "timeout"),
            UpstreamErrorKind::HttpStatus(code) => write!(f, "http status {}", code),
            UpstreamErrorKind::Network => write!(f, "network"),
            UpstreamErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Failure talking to an upstream service. Built where the call is made and
/// only matched on `kind` afterwards.
#[derive(Debug, Clone, Error)]
#[error("upstream {kind}: {detail}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub detail: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn status(code: u16, detail: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::HttpStatus(code), detail)
    }

    pub fn unknown(detail: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Unknown, detail)
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self.kind, UpstreamErrorKind::Timeout | UpstreamErrorKind::Network)
    }

    /// Reads a non-2xx response, keeping the upstream's `error` (or `detail`)
    /// field when the body is JSON.
    pub async fn from_response(resp: reqwest::Response) -> Self {
        let code = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let detail = serde_json
            ::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .or_else(|| v.get("detail"))
                    .and_then(|e| e.as_str().map(str::to_owned))
            })
            .unwrap_or_default();
        Self::status(code, detail)
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            UpstreamErrorKind::Timeout
        } else if let Some(status) = err.status() {
            UpstreamErrorKind::HttpStatus(status.as_u16())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            UpstreamErrorKind::Network
        } else {
            UpstreamErrorKind::Unknown
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::unknown(format!("malformed payload: {}", err))
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror request failed: {0}")]
    Request(String),
    #[error("mirror returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("mirror payload could not be read: {0}")]
    Decode(String),
    #[error("realtime channel error: {0}")]
    Channel(String),
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            MirrorError::Decode(err.to_string())
        } else {
            MirrorError::Request(err.to_string())
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Decode(err.to_string())
    }
}

/// Errors seen by the chat client library.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Upstream(#[from] UpstreamError),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("a message is already being sent")]
    Busy,
    #[error("message is empty")]
    EmptyMessage,
}
