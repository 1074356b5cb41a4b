use super::AppState;
use crate::cli::Args;
use crate::error::{ UpstreamError, UpstreamErrorKind };
use crate::llm::Provider;
use crate::models::chat::InferenceRequest;
use crate::relay::{ relay, CompletionReconciler };
use axum::{
    body::Body,
    extract::{ rejection::JsonRejection, Path, Query, State },
    http::{ header, StatusCode },
    response::{ IntoResponse, Response },
    routing::{ get, post },
    Json,
    Router,
};
use log::{ error, info, warn };
use serde::Deserialize;
use serde_json::json;
use std::error::Error;
use std::net::SocketAddr;
use thiserror::Error as ThisError;
use tower_http::cors::{ Any, CorsLayer };

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Upstream(#[from] UpstreamError),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            ApiError::Upstream(err) if err.is_unreachable() =>
                (StatusCode::SERVICE_UNAVAILABLE, "No response from SoulGraph API".to_string()),
            ApiError::Upstream(err) =>
                match err.kind {
                    UpstreamErrorKind::HttpStatus(code) => {
                        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
                        let message = if err.detail.is_empty() {
                            "Error from SoulGraph API".to_string()
                        } else {
                            err.detail.clone()
                        };
                        (status, message)
                    }
                    _ => {
                        let message = if err.detail.is_empty() {
                            "Unknown error".to_string()
                        } else {
                            err.detail.clone()
                        };
                        (StatusCode::INTERNAL_SERVER_ERROR, message)
                    }
                }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, self);
        } else {
            warn!("Request rejected ({}): {}", status, self);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ThreadListQuery {
    pub user_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ThreadOwnerQuery {
    pub user_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route(Provider::SoulGraph.route(), post(soulgraph_handler))
        .route(Provider::OpenAI.route(), post(openai_handler))
        .route("/api/soulgraph/health", get(health_handler))
        .route("/api/threads", get(list_threads_handler))
        .route("/api/threads/{thread_id}", get(get_thread_handler).delete(delete_thread_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    addr: &str,
    state: AppState,
    args: &Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = addr.parse::<SocketAddr>()?;
    let app = router(state);

    if let Some((cert_path, key_path)) = args.tls_paths() {
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;
        info!("Starting HTTPS relay on: https://{}", addr);
        axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
    } else {
        let listener = tokio::net::TcpListener
            ::bind(addr).await
            .map_err(|e| format!("Failed to bind relay to {}: {}. Try a different port.", addr, e))?;
        info!("Starting HTTP relay on: http://{}", addr);
        axum::serve(listener, app.into_make_service()).await?;
    }

    Ok(())
}

async fn soulgraph_handler(
    State(state): State<AppState>,
    body: Result<Json<InferenceRequest>, JsonRejection>
) -> Result<Response, ApiError> {
    infer(state, Provider::SoulGraph, body).await
}

async fn openai_handler(
    State(state): State<AppState>,
    body: Result<Json<InferenceRequest>, JsonRejection>
) -> Result<Response, ApiError> {
    infer(state, Provider::OpenAI, body).await
}

async fn infer(
    state: AppState,
    provider: Provider,
    body: Result<Json<InferenceRequest>, JsonRejection>
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is required".to_string()));
    }
    let backend = state
        .backend(provider)
        .ok_or_else(|| ApiError::Unavailable(format!("{} is not configured", provider)))?;

    let owner = request.user_id.clone().unwrap_or_else(|| state.default_user_id.clone());
    // Only SoulGraph keeps threads we can read back.
    let reconciler = match (&state.mirror, provider) {
        (Some(mirror), Provider::SoulGraph) =>
            Some(CompletionReconciler::new(state.threads.clone(), mirror.clone(), owner)),
        _ => None,
    };

    if request.is_stream() {
        info!("Relaying {} stream (thread {:?})", provider, request.thread_id);
        let upstream = backend.infer_stream(&request).await?;
        let relayed = relay(upstream, request.thread_id.clone(), reconciler);

        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(relayed.body))
            .map_err(|e| ApiError::Internal(e.to_string()));
    }

    let response = backend.infer(&request).await?;
    if let Some(reconciler) = reconciler {
        reconciler.reconcile(&response.thread_id).await;
    }
    Ok(Json(response).into_response())
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.threads.health().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => {
            error!("SoulGraph health check failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "Health check failed" }))).into_response()
        }
    }
}

async fn list_threads_handler(
    State(state): State<AppState>,
    Query(query): Query<ThreadListQuery>
) -> Result<Response, ApiError> {
    let user_id = query.user_id
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::BadRequest("user_id is required".to_string()))?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);

    info!("Fetching threads for user {} (limit {}, offset {})", user_id, limit, offset);
    let threads = state.threads.list_threads(&user_id, limit, offset).await?;
    Ok(Json(threads).into_response())
}

async fn get_thread_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<String>
) -> Result<Response, ApiError> {
    if thread_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Thread ID is required".to_string()));
    }
    let thread = state.threads.get_thread(&thread_id).await?;
    Ok(Json(thread).into_response())
}

async fn delete_thread_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<ThreadOwnerQuery>
) -> Result<Response, ApiError> {
    if thread_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Thread ID is required".to_string()));
    }
    let result = state.threads.delete_thread(&thread_id, query.user_id.as_deref()).await?;
    info!("Deleted thread {}", thread_id);

    if let Some(mirror) = &state.mirror {
        if let Err(e) = mirror.delete(&thread_id).await {
            warn!("Thread {} deleted upstream but not from the mirror: {}", thread_id, e);
        }
    }

    let body = if result.is_null() { json!({ "deleted": thread_id }) } else { result };
    Ok(Json(body).into_response())
}
