pub mod memory;
pub mod realtime;
pub mod supabase;

use async_trait::async_trait;
use log::{ debug, info };
use serde::{ Deserialize, Serialize };
use serde_json::Value as JsonValue;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::{ mpsc, oneshot, watch };

use crate::cli::Args;
use crate::error::MirrorError;
use crate::models::chat::MirrorRow;

pub use self::memory::MemoryMirror;
pub use self::realtime::RealtimeFeed;
pub use self::supabase::SupabaseMirror;

/// Best-effort copy of the upstream's threads, keyed by thread id.
#[async_trait]
pub trait ThreadMirror: Send + Sync {
    async fn upsert(&self, row: &MirrorRow) -> Result<(), MirrorError>;

    async fn delete(&self, thread_id: &str) -> Result<(), MirrorError>;

    async fn get(&self, thread_id: &str) -> Result<Option<MirrorRow>, MirrorError>;

    /// Rows ordered by `updated_at`, newest first.
    async fn list(&self, user_id: Option<&str>) -> Result<Vec<MirrorRow>, MirrorError>;
}

/// Push notifications for mirror row changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, MirrorError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// A row change as delivered to subscribers. `new` is absent on DELETE,
/// `old` usually carries only the primary key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub new: Option<JsonValue>,
    #[serde(default)]
    pub old: Option<JsonValue>,
}

impl ChangeEvent {
    /// Id of the affected row, from `new` or else `old`.
    pub fn row_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(|v| v.get("id"))
            .or_else(|| self.old.as_ref().and_then(|v| v.get("id")))
            .and_then(JsonValue::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeFilter {
    AllThreads,
    Thread(String),
}

impl ChangeFilter {
    /// PostgREST-style filter expression, if any.
    pub fn expression(&self) -> Option<String> {
        match self {
            ChangeFilter::AllThreads => None,
            ChangeFilter::Thread(id) => Some(format!("id=eq.{}", id)),
        }
    }

    pub fn topic(&self, table: &str) -> String {
        match self {
            ChangeFilter::AllThreads => format!("{}-all", table),
            ChangeFilter::Thread(id) => format!("{}-{}", table, id),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            ChangeFilter::AllThreads => true,
            ChangeFilter::Thread(id) => event.row_id() == Some(id.as_str()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    ChannelError(String),
    Closed,
}

/// A live change subscription. Dropping it tears the channel down.
pub struct Subscription {
    topic: String,
    events: mpsc::Receiver<ChangeEvent>,
    status: watch::Receiver<ChannelStatus>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(
        topic: String,
        events: mpsc::Receiver<ChangeEvent>,
        status: watch::Receiver<ChannelStatus>,
        shutdown: oneshot::Sender<()>
    ) -> Self {
        Self {
            topic,
            events,
            status,
            shutdown: Some(shutdown),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            debug!("Closing subscription {}", self.topic);
            let _ = tx.send(());
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn create_mirror(args: &Args) -> Result<Option<Arc<dyn ThreadMirror>>, Box<dyn Error + Send + Sync>> {
    match args.mirror_type.to_lowercase().as_str() {
        "supabase" => {
            let url = args.supabase_url
                .clone()
                .ok_or_else(|| "SUPABASE_URL is required for the supabase mirror".to_string())?;
            let mirror = SupabaseMirror::new(&url, &args.supabase_service_role_key, &args.supabase_table)?;
            Ok(Some(Arc::new(mirror)))
        }
        "memory" => Ok(Some(Arc::new(MemoryMirror::new()))),
        "none" | "" => Ok(None),
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported mirror type: {}", args.mirror_type)
                    )
                )
            ),
    }
}

pub fn initialize_mirror(args: &Args) -> Result<Option<Arc<dyn ThreadMirror>>, Box<dyn Error + Send + Sync>> {
    info!("Conversations will be mirrored to: {}", args.mirror_type);
    create_mirror(args)
}
