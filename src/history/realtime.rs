//! Supabase Realtime change feed.
//!
//! Speaks the Phoenix channel protocol (v1 JSON) over a websocket: join a
//! `realtime:<topic>` channel with a `postgres_changes` config, keep the socket
//! alive with heartbeats, and turn `postgres_changes` pushes into
//! [`ChangeEvent`]s.

use async_trait::async_trait;
use futures::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };
use serde_json::{ json, Value as JsonValue };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{ mpsc, oneshot, watch };
use tokio_tungstenite::{ connect_async, tungstenite::protocol::Message };

use super::{ ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, ChannelStatus, Subscription };
use crate::error::MirrorError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 64;
const PROTOCOL_VSN: &str = "1.0.0";

pub struct RealtimeFeed {
    socket_url: String,
    api_key: String,
    schema: String,
    table: String,
    connect_timeout: Duration,
    refs: Arc<AtomicU64>,
}

#[derive(Debug, PartialEq)]
enum Inbound {
    Joined,
    JoinRejected(String),
    Change(ChangeEvent),
    ChannelError(String),
    Closed,
    Ignored,
}

impl RealtimeFeed {
    pub fn new(supabase_url: &str, api_key: &str, table: &str) -> Result<Self, MirrorError> {
        Ok(Self {
            socket_url: socket_url(supabase_url, api_key)?,
            api_key: api_key.to_string(),
            schema: "public".to_string(),
            table: table.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
            refs: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn join_message(&self, topic: &str, filter: &ChangeFilter, join_ref: u64) -> JsonValue {
        let mut change = json!({
            "event": "*",
            "schema": self.schema,
            "table": self.table,
        });
        if let Some(expr) = filter.expression() {
            change["filter"] = JsonValue::String(expr);
        }
        json!({
            "topic": topic,
            "event": "phx_join",
            "payload": {
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [change],
                },
                "access_token": self.api_key,
            },
            "ref": join_ref.to_string(),
            "join_ref": join_ref.to_string(),
        })
    }
}

fn socket_url(supabase_url: &str, api_key: &str) -> Result<String, MirrorError> {
    let mut url = url::Url
        ::parse(supabase_url)
        .map_err(|e| MirrorError::Channel(format!("invalid Supabase URL {}: {}", supabase_url, e)))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url
        .set_scheme(scheme)
        .map_err(|_| MirrorError::Channel(format!("cannot derive websocket URL from {}", supabase_url)))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut().clear().append_pair("apikey", api_key).append_pair("vsn", PROTOCOL_VSN);
    Ok(url.to_string())
}

fn control_message(topic: &str, event: &str, msg_ref: u64) -> Message {
    Message::Text(
        json!({ "topic": topic, "event": event, "payload": {}, "ref": msg_ref.to_string() }).to_string()
    )
}

fn decode_inbound(text: &str, topic: &str) -> Inbound {
    let value: JsonValue = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("Unreadable realtime message ({}): {}", e, text);
            return Inbound::Ignored;
        }
    };
    if value.get("topic").and_then(JsonValue::as_str) != Some(topic) {
        return Inbound::Ignored;
    }
    let payload = value.get("payload").cloned().unwrap_or(JsonValue::Null);

    match value.get("event").and_then(JsonValue::as_str).unwrap_or_default() {
        "phx_reply" => {
            let is_join = payload
                .get("response")
                .and_then(|r| r.get("postgres_changes"))
                .is_some();
            match payload.get("status").and_then(JsonValue::as_str) {
                Some("ok") if is_join => Inbound::Joined,
                Some("ok") => Inbound::Ignored,
                _ => Inbound::JoinRejected(payload.get("response").map(|r| r.to_string()).unwrap_or_default()),
            }
        }
        "postgres_changes" => {
            let data = payload.get("data").cloned().unwrap_or(JsonValue::Null);
            let kind = data
                .get("type")
                .or_else(|| data.get("eventType"))
                .and_then(JsonValue::as_str)
                .and_then(ChangeKind::parse);
            match kind {
                Some(event_type) =>
                    Inbound::Change(ChangeEvent {
                        event_type,
                        new: data.get("record").cloned().filter(|r| !is_empty_record(r)),
                        old: data.get("old_record").cloned().filter(|r| !is_empty_record(r)),
                    }),
                None => Inbound::Ignored,
            }
        }
        "system" =>
            match payload.get("status").and_then(JsonValue::as_str) {
                Some("error") =>
                    Inbound::ChannelError(
                        payload.get("message").and_then(JsonValue::as_str).unwrap_or("system error").to_string()
                    ),
                _ => Inbound::Ignored,
            }
        "phx_error" => Inbound::ChannelError("channel crashed".to_string()),
        "phx_close" => Inbound::Closed,
        _ => Inbound::Ignored,
    }
}

fn is_empty_record(value: &JsonValue) -> bool {
    value.is_null() || value.as_object().map_or(false, |o| o.is_empty())
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, MirrorError> {
        let topic = format!("realtime:{}", filter.topic(&self.table));
        let (ws, _) = tokio::time
            ::timeout(self.connect_timeout, connect_async(self.socket_url.as_str())).await
            .map_err(|_| MirrorError::Channel(format!("realtime connect timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| MirrorError::Channel(format!("realtime connect failed: {}", e)))?;
        let (mut sink, mut stream) = ws.split();

        let join_ref = self.refs.fetch_add(1, Ordering::Relaxed);
        let join = self.join_message(&topic, &filter, join_ref);
        sink
            .send(Message::Text(join.to_string())).await
            .map_err(|e| MirrorError::Channel(format!("realtime join failed: {}", e)))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let refs = self.refs.clone();
        let task_topic = topic.clone();

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        let leave = control_message(&task_topic, "phx_leave", refs.fetch_add(1, Ordering::Relaxed));
                        let _ = sink.send(leave).await;
                        let _ = sink.close().await;
                        break;
                    }
                    _ = heartbeat.tick() => {
                        let beat = control_message("phoenix", "heartbeat", refs.fetch_add(1, Ordering::Relaxed));
                        if let Err(e) = sink.send(beat).await {
                            warn!("Realtime heartbeat failed on {}: {}", task_topic, e);
                            let _ = status_tx.send(ChannelStatus::ChannelError(e.to_string()));
                            break;
                        }
                    }
                    msg = stream.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Realtime socket closed for {}", task_topic);
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                error!("Realtime socket error on {}: {}", task_topic, e);
                                let _ = status_tx.send(ChannelStatus::ChannelError(e.to_string()));
                                break;
                            }
                        };
                        match decode_inbound(&text, &task_topic) {
                            Inbound::Joined => {
                                info!("Subscribed to {}", task_topic);
                                let _ = status_tx.send(ChannelStatus::Subscribed);
                            }
                            Inbound::JoinRejected(reason) | Inbound::ChannelError(reason) => {
                                warn!("Realtime channel {} failed: {}", task_topic, reason);
                                let _ = status_tx.send(ChannelStatus::ChannelError(reason));
                            }
                            Inbound::Change(event) => {
                                if events_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Inbound::Closed => break,
                            Inbound::Ignored => {}
                        }
                    }
                }
            }
            let _ = status_tx.send(ChannelStatus::Closed);
        });

        Ok(Subscription::new(topic, events_rx, status_rx, shutdown_tx))
    }
}
