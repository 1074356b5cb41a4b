//! Turns a frame stream into message state.
//!
//! ```text
//! Idle -> AwaitingFirstChunk -> Accumulating -> Complete
//!              \___________________\________-> Error
//! ```
//!
//! The user message is appended optimistically when a send begins and is
//! never removed. The assistant message is created by the first chunk and
//! its content is always the whole accumulated text.

use log::debug;

use crate::models::chat::{ ChatMessage, InferenceResponse };
use crate::models::stream::StreamFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingFirstChunk,
    Accumulating,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    ThreadIdLatched(String),
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Reassembler {
    phase: Phase,
    messages: Vec<ChatMessage>,
    accumulator: String,
    assistant_index: Option<usize>,
    thread_id: Option<String>,
    error: Option<String>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(None, Vec::new())
    }
}

impl Reassembler {
    pub fn new(thread_id: Option<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            phase: Phase::Idle,
            messages,
            accumulator: String::new(),
            assistant_index: None,
            thread_id,
            error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, Phase::AwaitingFirstChunk | Phase::Accumulating)
    }

    /// True once the current reply has produced any text.
    pub fn chunk_received(&self) -> bool {
        self.assistant_index.is_some()
    }

    pub fn begin(&mut self, user_message: ChatMessage) {
        self.messages.push(user_message);
        self.accumulator.clear();
        self.assistant_index = None;
        self.error = None;
        self.phase = Phase::AwaitingFirstChunk;
    }

    pub fn apply(&mut self, frame: StreamFrame) -> Vec<ReassemblyEvent> {
        if !self.is_loading() {
            debug!("Ignoring {:?} in phase {:?}", frame, self.phase);
            return Vec::new();
        }
        match frame {
            StreamFrame::ThreadId(id) => self.latch(id).into_iter().collect(),
            StreamFrame::Chunk(text) => {
                self.accumulator.push_str(&text);
                match self.assistant_index {
                    Some(i) => {
                        self.messages[i].content = self.accumulator.clone();
                    }
                    None => {
                        self.messages.push(ChatMessage::assistant(self.accumulator.clone()));
                        self.assistant_index = Some(self.messages.len() - 1);
                        self.phase = Phase::Accumulating;
                    }
                }
                Vec::new()
            }
            StreamFrame::Done => {
                self.phase = Phase::Complete;
                vec![ReassemblyEvent::Completed]
            }
            StreamFrame::Error(message) => self.fail(message),
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Vec<ReassemblyEvent> {
        let message = message.into();
        if let Some(i) = self.assistant_index.take() {
            if self.messages[i].content.is_empty() {
                self.messages.remove(i);
            }
        }
        self.error = Some(message.clone());
        self.phase = Phase::Error;
        vec![ReassemblyEvent::Failed(message)]
    }

    /// Finishes the current send with a whole (non-streamed) reply.
    pub fn complete_with(&mut self, response: InferenceResponse) -> Vec<ReassemblyEvent> {
        let mut events: Vec<ReassemblyEvent> = self.latch(response.thread_id).into_iter().collect();
        self.messages.push(ChatMessage::assistant(response.response));
        self.assistant_index = Some(self.messages.len() - 1);
        self.phase = Phase::Complete;
        events.push(ReassemblyEvent::Completed);
        events
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
        if self.phase == Phase::Error {
            self.phase = Phase::Idle;
        }
    }

    /// Overwrites the history with a newer copy, unless a reply is in flight.
    pub fn replace_messages(&mut self, messages: Vec<ChatMessage>) -> bool {
        if self.is_loading() {
            return false;
        }
        self.messages = messages;
        self.assistant_index = None;
        true
    }

    fn latch(&mut self, id: String) -> Option<ReassemblyEvent> {
        if self.thread_id.is_some() || id.is_empty() {
            return None;
        }
        self.thread_id = Some(id.clone());
        Some(ReassemblyEvent::ThreadIdLatched(id))
    }
}
