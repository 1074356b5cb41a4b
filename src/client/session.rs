use futures::StreamExt;
use log::{ debug, info, warn };
use std::sync::Arc;
use uuid::Uuid;

use super::api::ChatTransport;
use super::bridge::{ DetailAction, ThreadDetailBridge };
use super::reassembler::{ Reassembler, ReassemblyEvent };
use crate::error::ClientError;
use crate::history::{ ChangeEvent, ChangeFeed, ChangeFilter, ChannelStatus, Subscription, ThreadMirror };
use crate::models::chat::{ ChatMessage, InferenceRequest };
use crate::models::stream::StreamFrame;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub user_id: String,
    pub system_prompt: Option<String>,
    pub streaming: bool,
    pub training: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            user_id: "test-user-123".to_string(),
            system_prompt: None,
            streaming: true,
            training: false,
        }
    }
}

/// One chat view: the selected thread, its messages and its live
/// subscription.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    mirror: Option<Arc<dyn ThreadMirror>>,
    feed: Option<Arc<dyn ChangeFeed>>,
    options: SessionOptions,
    state: Reassembler,
    detail: Option<ThreadDetailBridge>,
    subscription: Option<Subscription>,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn ChatTransport>, options: SessionOptions) -> Self {
        Self {
            transport,
            mirror: None,
            feed: None,
            options,
            state: Reassembler::default(),
            detail: None,
            subscription: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn ThreadMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn state(&self) -> &Reassembler {
        &self.state
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.state.messages()
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.state.thread_id()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn subscription_status(&self) -> Option<ChannelStatus> {
        self.subscription.as_ref().map(Subscription::status)
    }

    pub fn dismiss_error(&mut self) {
        self.state.dismiss_error();
    }

    pub async fn send(&mut self, text: &str) -> Result<Vec<ReassemblyEvent>, ClientError> {
        self.send_with(text, |_| {}).await
    }

    /// Sends a message and drives the reply to a terminal state. `on_update`
    /// sees the state after every frame.
    pub async fn send_with<F>(&mut self, text: &str, mut on_update: F) -> Result<Vec<ReassemblyEvent>, ClientError>
        where F: FnMut(&Reassembler) + Send
    {
        if text.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if self.state.is_loading() {
            return Err(ClientError::Busy);
        }

        let request = InferenceRequest {
            message: text.to_string(),
            user_id: Some(self.options.user_id.clone()),
            thread_id: self.state.thread_id().map(str::to_owned),
            new_thread: Some(self.state.thread_id().is_none()),
            system_prompt: self.options.system_prompt.clone(),
            stream: Some(self.options.streaming),
            model: None,
            training: Some(self.options.training),
        };

        let mut user_message = ChatMessage::user(text);
        user_message.id = Some(Uuid::new_v4().to_string());
        self.state.begin(user_message);
        on_update(&self.state);

        let events = if self.options.streaming {
            self.run_stream(&request, &mut on_update).await
        } else {
            match self.transport.send(&request).await {
                Ok(response) => self.state.complete_with(response),
                Err(e) => self.state.fail(e.to_string()),
            }
        };
        on_update(&self.state);

        let latched = events.iter().find_map(|e| match e {
            ReassemblyEvent::ThreadIdLatched(id) => Some(id.clone()),
            _ => None,
        });
        if let Some(id) = latched {
            info!("Conversation is now thread {}", id);
            self.watch_thread(&id).await;
        }

        Ok(events)
    }

    async fn run_stream<F>(&mut self, request: &InferenceRequest, on_update: &mut F) -> Vec<ReassemblyEvent>
        where F: FnMut(&Reassembler) + Send
    {
        let mut events = Vec::new();
        let mut stream = match self.transport.send_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Streaming request failed: {}", e);
                events.extend(self.fall_back(request).await);
                return events;
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(frame) => {
                    let terminal = frame.is_terminal();
                    events.extend(self.state.apply(frame));
                    on_update(&self.state);
                    if terminal {
                        return events;
                    }
                }
                Err(e) => {
                    warn!("Stream interrupted: {}", e);
                    if self.state.chunk_received() {
                        events.extend(self.state.fail(e.to_string()));
                    } else {
                        events.extend(self.fall_back(request).await);
                    }
                    return events;
                }
            }
        }

        // Ended without a terminal frame.
        if self.state.chunk_received() {
            debug!("Stream closed without done, keeping the reply");
            events.extend(self.state.apply(StreamFrame::Done));
        } else {
            events.extend(self.fall_back(request).await);
        }
        events
    }

    /// One non-streaming retry of the same request.
    async fn fall_back(&mut self, request: &InferenceRequest) -> Vec<ReassemblyEvent> {
        info!("Falling back to a standard request");
        match self.transport.send(&request.streaming(false)).await {
            Ok(response) => self.state.complete_with(response),
            Err(e) => self.state.fail(e.to_string()),
        }
    }

    /// Starts an empty conversation.
    pub fn new_chat(&mut self) {
        self.unsubscribe();
        self.detail = None;
        self.state = Reassembler::default();
    }

    pub async fn select_thread(&mut self, thread_id: &str) -> Result<(), ClientError> {
        if self.state.is_loading() {
            return Err(ClientError::Busy);
        }
        self.unsubscribe();
        self.load_thread(thread_id).await?;
        self.watch_thread(thread_id).await;
        Ok(())
    }

    /// Reads a thread's history: the mirror first, the relay otherwise.
    pub async fn load_thread(&mut self, thread_id: &str) -> Result<(), ClientError> {
        let messages = match self.load_from_mirror(thread_id).await {
            Some(messages) => messages,
            None => self.transport.get_thread(thread_id).await?.messages,
        };
        debug!("Loaded {} messages for thread {}", messages.len(), thread_id);
        self.state = Reassembler::new(Some(thread_id.to_string()), messages);
        self.detail = Some(ThreadDetailBridge::new(thread_id));
        Ok(())
    }

    async fn load_from_mirror(&self, thread_id: &str) -> Option<Vec<ChatMessage>> {
        let mirror = self.mirror.as_ref()?;
        match mirror.get(thread_id).await {
            Ok(Some(row)) if row.messages.is_array() => Some(row.message_list()),
            Ok(_) => None,
            Err(e) => {
                warn!("Mirror read for {} failed, asking the relay: {}", thread_id, e);
                None
            }
        }
    }

    async fn watch_thread(&mut self, thread_id: &str) {
        self.unsubscribe();
        if self.detail.as_ref().map(ThreadDetailBridge::thread_id) != Some(thread_id) {
            self.detail = Some(ThreadDetailBridge::new(thread_id));
        }
        let feed = match &self.feed {
            Some(feed) => feed.clone(),
            None => {
                return;
            }
        };
        match feed.subscribe(ChangeFilter::Thread(thread_id.to_string())).await {
            Ok(subscription) => {
                debug!("Watching {}", subscription.topic());
                self.subscription = Some(subscription);
            }
            Err(e) => warn!("Live updates unavailable for {}: {}", thread_id, e),
        }
    }

    fn unsubscribe(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    /// Applies every change that has arrived since the last call.
    pub async fn poll_changes(&mut self) -> Result<Vec<DetailAction>, ClientError> {
        let mut pending = Vec::new();
        if let Some(subscription) = self.subscription.as_mut() {
            while let Some(event) = subscription.try_recv() {
                pending.push(event);
            }
        }
        let mut actions = Vec::with_capacity(pending.len());
        for event in pending {
            actions.push(self.handle_change(&event).await?);
        }
        Ok(actions)
    }

    pub async fn handle_change(&mut self, event: &ChangeEvent) -> Result<DetailAction, ClientError> {
        let action = match &self.detail {
            Some(bridge) => bridge.reconcile(event, self.state.messages().len()),
            None => DetailAction::Ignore,
        };

        match &action {
            DetailAction::Replace(messages) => {
                if !self.state.replace_messages(messages.clone()) {
                    debug!("Reply in flight, deferring pushed update");
                }
            }
            DetailAction::Refetch => {
                if !self.state.is_loading() {
                    if let Some(id) = self.state.thread_id().map(str::to_owned) {
                        self.load_thread(&id).await?;
                    }
                }
            }
            DetailAction::Clear => {
                info!("Thread was deleted, clearing the view");
                self.new_chat();
            }
            DetailAction::Ignore => {}
        }
        Ok(action)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
