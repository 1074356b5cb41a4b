use log::{ debug, warn };
use std::sync::Arc;

use super::bridge::{ ListAction, ThreadListBridge };
use crate::error::MirrorError;
use crate::history::{ ChangeFeed, ChangeFilter, ChannelStatus, Subscription, ThreadMirror };
use crate::models::chat::MirrorRow;

/// The thread list read from the mirror and kept current by the
/// all-threads channel.
pub struct ThreadListView {
    mirror: Arc<dyn ThreadMirror>,
    feed: Option<Arc<dyn ChangeFeed>>,
    user_id: Option<String>,
    bridge: ThreadListBridge,
    subscription: Option<Subscription>,
}

impl ThreadListView {
    pub fn new(mirror: Arc<dyn ThreadMirror>, user_id: Option<String>) -> Self {
        Self {
            mirror,
            feed: None,
            bridge: ThreadListBridge::for_user(user_id.clone()),
            user_id,
            subscription: None,
        }
    }

    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn rows(&self) -> &[MirrorRow] {
        self.bridge.rows()
    }

    pub fn subscription_status(&self) -> Option<ChannelStatus> {
        self.subscription.as_ref().map(Subscription::status)
    }

    pub async fn refresh(&mut self) -> Result<(), MirrorError> {
        let rows = self.mirror.list(self.user_id.as_deref()).await?;
        debug!("Thread list holds {} rows", rows.len());
        self.bridge.replace_all(rows);
        Ok(())
    }

    /// Loads the list and starts listening. The list still works through
    /// `refresh` when the channel cannot be opened.
    pub async fn open(&mut self) -> Result<(), MirrorError> {
        self.close();
        self.refresh().await?;
        if let Some(feed) = &self.feed {
            match feed.subscribe(ChangeFilter::AllThreads).await {
                Ok(subscription) => {
                    self.subscription = Some(subscription);
                }
                Err(e) => warn!("Live list updates unavailable: {}", e),
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    /// Applies pending changes; returns true when the list changed.
    pub async fn poll_changes(&mut self) -> Result<bool, MirrorError> {
        let mut changed = false;
        let mut refetch = false;
        if let Some(subscription) = self.subscription.as_mut() {
            while let Some(event) = subscription.try_recv() {
                match self.bridge.apply(&event) {
                    ListAction::Changed => {
                        changed = true;
                    }
                    ListAction::Refetch => {
                        refetch = true;
                    }
                    ListAction::Ignore => {}
                }
            }
        }
        if refetch {
            self.refresh().await?;
            changed = true;
        }
        Ok(changed)
    }
}

impl Drop for ThreadListView {
    fn drop(&mut self) {
        self.close();
    }
}
