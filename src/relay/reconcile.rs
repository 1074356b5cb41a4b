use log::{ error, info, warn };
use std::sync::Arc;

use crate::history::ThreadMirror;
use crate::llm::chat::ThreadBackend;
use crate::models::chat::MirrorRow;

/// Copies a finished conversation from the upstream into the mirror.
///
/// Consumed by [`reconcile`](Self::reconcile), so one stream can trigger at
/// most one write. Failures are logged and dropped; nothing is retried.
pub struct CompletionReconciler {
    threads: Arc<dyn ThreadBackend>,
    mirror: Arc<dyn ThreadMirror>,
    owner: String,
}

impl CompletionReconciler {
    pub fn new(threads: Arc<dyn ThreadBackend>, mirror: Arc<dyn ThreadMirror>, owner: impl Into<String>) -> Self {
        Self {
            threads,
            mirror,
            owner: owner.into(),
        }
    }

    pub async fn reconcile(self, thread_id: &str) -> bool {
        let thread = match self.threads.get_thread(thread_id).await {
            Ok(thread) => thread,
            Err(e) => {
                warn!("Could not read thread {} for mirroring: {}", thread_id, e);
                return false;
            }
        };

        let row = MirrorRow::from_thread(&thread, &self.owner);
        match self.mirror.upsert(&row).await {
            Ok(()) => {
                info!("Mirrored thread {} ({} messages)", thread_id, thread.messages.len());
                true
            }
            Err(e) => {
                error!("Failed to mirror thread {}: {}", thread_id, e);
                false
            }
        }
    }
}
