use chrono::{ DateTime, Duration, TimeZone, Utc };
use serde::{ Deserialize, Deserializer, Serialize };
use serde_json::Value as JsonValue;

const TITLE_MAX_CHARS: usize = 50;
const DEFAULT_TITLE: &str = "New Chat";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Accepts RFC 3339 strings, epoch seconds or epoch milliseconds. Anything
/// else (including `null`) becomes the current instant.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where D: Deserializer<'de>
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(parse_timestamp).unwrap_or_else(Utc::now))
}

pub fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) =>
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    // Postgres `timestamp` columns come back without an offset.
                    chrono::NaiveDateTime
                        ::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|naive| naive.and_utc())
                }),
        JsonValue::Number(n) => {
            let raw = n.as_i64()?;
            if raw.abs() < 100_000_000_000 {
                Utc.timestamp_opt(raw, 0).single()
            } else {
                Utc.timestamp_millis_opt(raw).single()
            }
        }
        _ => None,
    }
}

/// Converts a loosely-typed `messages` array (as found in datastore rows and
/// change payloads) into typed messages. Entries that cannot be read are
/// skipped.
pub fn messages_from_json(value: &JsonValue) -> Option<Vec<ChatMessage>> {
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| serde_json::from_value::<ChatMessage>(item.clone()).ok())
            .collect()
    )
}

pub fn derive_title(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .find(|m| m.role == Role::User && !m.content.trim().is_empty())
        .map(|m| m.content.trim().chars().take(TITLE_MAX_CHARS).collect())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "user_id", skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl ConversationThread {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            owner: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a message and advances `updated_at`.
    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.touch();
    }

    /// `updated_at` must strictly increase on every mutation, even when the
    /// wall clock has not moved since the previous one.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::milliseconds(1)
        };
    }

    pub fn display_title(&self) -> String {
        derive_title(&self.messages)
            .or_else(|| self.title.clone().filter(|t| !t.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_TITLE.to_string())
    }
}

/// Row shape of the `chat_threads` mirror table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MirrorRow {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub messages: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl MirrorRow {
    pub fn from_thread(thread: &ConversationThread, owner: &str) -> Self {
        Self {
            id: thread.id.clone(),
            title: Some(thread.display_title()),
            user_id: Some(thread.owner.clone().unwrap_or_else(|| owner.to_string())),
            messages: serde_json::to_value(&thread.messages).unwrap_or_else(|_| JsonValue::Array(Vec::new())),
            created_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn message_list(&self) -> Vec<ChatMessage> {
        messages_from_json(&self.messages).unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_thread: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<bool>,
}

impl InferenceRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn streaming(&self, stream: bool) -> Self {
        Self {
            stream: Some(stream),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub response: String,
    pub thread_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ThreadList {
    #[serde(default)]
    pub threads: Vec<ConversationThread>,
}
