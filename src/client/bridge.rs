//! Reconciles pushed mirror changes against what a view already holds.

use log::debug;
use serde_json::Value as JsonValue;

use crate::history::{ ChangeEvent, ChangeKind };
use crate::models::chat::{ messages_from_json, ChatMessage, MirrorRow };

#[derive(Debug, Clone, PartialEq)]
pub enum DetailAction {
    /// The pushed row is ahead of us: take its messages as they are.
    Replace(Vec<ChatMessage>),
    /// Something changed but the payload is not enough, read the thread again.
    Refetch,
    /// The thread is gone.
    Clear,
    Ignore,
}

/// Detail view of one thread.
#[derive(Debug, Clone)]
pub struct ThreadDetailBridge {
    thread_id: String,
}

impl ThreadDetailBridge {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self { thread_id: thread_id.into() }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn reconcile(&self, event: &ChangeEvent, local_count: usize) -> DetailAction {
        if let Some(id) = event.row_id() {
            if id != self.thread_id {
                return DetailAction::Ignore;
            }
        }

        match event.event_type {
            ChangeKind::Delete => DetailAction::Clear,
            ChangeKind::Insert | ChangeKind::Update => {
                let pushed = event.new
                    .as_ref()
                    .and_then(|row| row.get("messages"))
                    .and_then(messages_from_json);
                match pushed {
                    Some(messages) if messages.len() > local_count => {
                        debug!("Thread {} advanced {} -> {} messages", self.thread_id, local_count, messages.len());
                        DetailAction::Replace(messages)
                    }
                    _ => DetailAction::Refetch,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListAction {
    Changed,
    Refetch,
    /// The change concerns a row this list does not show.
    Ignore,
}

/// The "all threads" list, newest first, optionally limited to one owner.
#[derive(Debug, Clone, Default)]
pub struct ThreadListBridge {
    rows: Vec<MirrorRow>,
    user_id: Option<String>,
}

impl ThreadListBridge {
    pub fn new(rows: Vec<MirrorRow>) -> Self {
        Self { rows, user_id: None }
    }

    /// A list that only keeps rows owned by `user_id`.
    pub fn for_user(user_id: Option<String>) -> Self {
        Self { rows: Vec::new(), user_id }
    }

    pub fn rows(&self) -> &[MirrorRow] {
        &self.rows
    }

    pub fn replace_all(&mut self, rows: Vec<MirrorRow>) {
        self.rows = rows;
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> ListAction {
        match event.event_type {
            ChangeKind::Insert => {
                match event.new.clone().map(serde_json::from_value::<MirrorRow>) {
                    Some(Ok(row)) => self.place(row),
                    _ => ListAction::Refetch,
                }
            }
            ChangeKind::Update => {
                let patch = match event.new.as_ref().filter(|v| v.get("id").and_then(JsonValue::as_str).is_some()) {
                    Some(patch) => patch,
                    None => {
                        return ListAction::Refetch;
                    }
                };
                let id = patch.get("id").and_then(JsonValue::as_str).unwrap_or_default();
                let row = match self.position(id) {
                    Some(i) => merge_row(&self.rows[i], patch),
                    None => serde_json::from_value::<MirrorRow>(patch.clone()).ok(),
                };
                match row {
                    Some(row) => self.place(row),
                    None => ListAction::Refetch,
                }
            }
            ChangeKind::Delete => {
                match event.row_id().map(str::to_owned) {
                    Some(id) => {
                        self.rows.retain(|r| r.id != id);
                        ListAction::Changed
                    }
                    None => ListAction::Refetch,
                }
            }
        }
    }

    fn owns(&self, row: &MirrorRow) -> bool {
        match &self.user_id {
            Some(user_id) => row.user_id.as_deref() == Some(user_id.as_str()),
            None => true,
        }
    }

    /// Updates a known row in place or puts a new one on top. A row that
    /// belongs to someone else is dropped from the list.
    fn place(&mut self, row: MirrorRow) -> ListAction {
        let position = self.position(&row.id);
        if !self.owns(&row) {
            return match position {
                Some(i) => {
                    debug!("Thread {} is no longer ours, removing it", row.id);
                    self.rows.remove(i);
                    ListAction::Changed
                }
                None => ListAction::Ignore,
            };
        }
        match position {
            Some(i) => {
                self.rows[i] = row;
            }
            None => self.rows.insert(0, row),
        }
        ListAction::Changed
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows.iter().position(|r| r.id == id)
    }
}

fn merge_row(current: &MirrorRow, patch: &JsonValue) -> Option<MirrorRow> {
    let mut base = serde_json::to_value(current).ok()?;
    let (target, fields) = (base.as_object_mut()?, patch.as_object()?);
    for (key, value) in fields {
        target.insert(key.clone(), value.clone());
    }
    serde_json::from_value(base).ok()
}
