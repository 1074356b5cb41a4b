use async_trait::async_trait;
use log::{ debug, warn };
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::{ broadcast, mpsc, oneshot, watch, RwLock };

use super::{ ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, ChannelStatus, Subscription, ThreadMirror };
use crate::error::MirrorError;
use crate::models::chat::MirrorRow;

const FEED_CAPACITY: usize = 64;

/// In-process mirror with a change feed, for local runs and tests.
pub struct MemoryMirror {
    rows: RwLock<HashMap<String, MirrorRow>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMirror {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            rows: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine.
        let _ = self.changes.send(event);
    }
}

#[async_trait]
impl ThreadMirror for MemoryMirror {
    async fn upsert(&self, row: &MirrorRow) -> Result<(), MirrorError> {
        let mut stored = row.clone();
        let previous = {
            let mut rows = self.rows.write().await;
            if let Some(prev) = rows.get(&row.id) {
                stored.created_at = stored.created_at.or(prev.created_at);
            } else if stored.created_at.is_none() {
                stored.created_at = Some(stored.updated_at);
            }
            rows.insert(row.id.clone(), stored.clone())
        };

        let event = ChangeEvent {
            event_type: if previous.is_some() { ChangeKind::Update } else { ChangeKind::Insert },
            new: Some(serde_json::to_value(&stored)?),
            old: previous.map(|p| json!({ "id": p.id })),
        };
        self.publish(event);
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> Result<(), MirrorError> {
        let removed = self.rows.write().await.remove(thread_id);
        if removed.is_some() {
            self.publish(ChangeEvent {
                event_type: ChangeKind::Delete,
                new: None,
                old: Some(json!({ "id": thread_id })),
            });
        }
        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<MirrorRow>, MirrorError> {
        Ok(self.rows.read().await.get(thread_id).cloned())
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<MirrorRow>, MirrorError> {
        let rows = self.rows.read().await;
        let mut out: Vec<MirrorRow> = rows
            .values()
            .filter(|r| user_id.map_or(true, |u| r.user_id.as_deref() == Some(u)))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }
}

#[async_trait]
impl ChangeFeed for MemoryMirror {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, MirrorError> {
        let topic = filter.topic("memory");
        let mut changes = self.changes.subscribe();
        let (events_tx, events_rx) = mpsc::channel(FEED_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Subscribed);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task_topic = topic.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    received = changes.recv() => match received {
                        Ok(event) => {
                            if filter.matches(&event) && events_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Subscription {} lagged, {} changes skipped", task_topic, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            let _ = status_tx.send(ChannelStatus::Closed);
            debug!("Subscription {} closed", task_topic);
        });

        Ok(Subscription::new(topic, events_rx, status_rx, shutdown_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{ Duration, Utc };

    fn row(id: &str, user: &str) -> MirrorRow {
        MirrorRow {
            id: id.into(),
            title: Some("Hello".into()),
            user_id: Some(user.into()),
            messages: json!([]),
            created_at: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let mirror = MemoryMirror::new();
        let mut older = row("a", "u1");
        older.updated_at = Utc::now() - Duration::seconds(10);
        mirror.upsert(&older).await.unwrap();
        mirror.upsert(&row("b", "u1")).await.unwrap();
        mirror.upsert(&row("c", "u2")).await.unwrap();

        let ids: Vec<String> = mirror.list(Some("u1")).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn feed_reports_insert_update_delete_for_filtered_thread() {
        let mirror = MemoryMirror::new();
        let mut sub = mirror.subscribe(ChangeFilter::Thread("t1".into())).await.unwrap();
        assert_eq!(sub.status(), ChannelStatus::Subscribed);

        mirror.upsert(&row("other", "u1")).await.unwrap();
        mirror.upsert(&row("t1", "u1")).await.unwrap();
        mirror.upsert(&row("t1", "u1")).await.unwrap();
        mirror.delete("t1").await.unwrap();

        let kinds = vec![
            sub.recv().await.unwrap().event_type,
            sub.recv().await.unwrap().event_type,
            sub.recv().await.unwrap().event_type
        ];
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
    }

    #[tokio::test]
    async fn upsert_keeps_original_created_at() {
        let mirror = MemoryMirror::new();
        mirror.upsert(&row("t1", "u1")).await.unwrap();
        let first = mirror.get("t1").await.unwrap().unwrap().created_at;
        mirror.upsert(&row("t1", "u1")).await.unwrap();
        assert_eq!(mirror.get("t1").await.unwrap().unwrap().created_at, first);
        assert_eq!(mirror.len().await, 1);
    }
}
