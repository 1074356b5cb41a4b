//! Byte-for-byte forwarding of an upstream SSE stream, with a side channel that
//! watches the frames go by.
//!
//! Every upstream chunk is sent downstream untouched before it is inspected.
//! The inspection only latches the thread id and notices the terminal frame;
//! once the stream is over and the downstream side has been released, the
//! optional [`CompletionReconciler`] mirrors the finished conversation.

pub mod parser;
pub mod reconcile;

use bytes::Bytes;
use futures::StreamExt;
use log::{ debug, info, warn };
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use self::parser::FrameParser;
use crate::error::UpstreamError;
use crate::llm::chat::ByteStream;
use crate::models::stream::StreamFrame;

pub use self::reconcile::CompletionReconciler;

const RELAY_BUFFER: usize = 32;

/// What the side channel saw on one stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub thread_id: Option<String>,
    pub chunks: usize,
    pub done: bool,
    pub error: Option<String>,
    pub bad_events: usize,
    pub aborted: bool,
}

impl StreamSummary {
    pub fn completed(&self) -> bool {
        self.done && !self.aborted
    }
}

/// Frame observer fed with the same bytes that go downstream.
#[derive(Debug, Default)]
pub struct StreamTap {
    parser: FrameParser,
    summary: StreamSummary,
}

impl StreamTap {
    pub fn new(request_thread_id: Option<String>) -> Self {
        Self {
            parser: FrameParser::new(),
            summary: StreamSummary {
                thread_id: request_thread_id.filter(|id| !id.is_empty()),
                ..Default::default()
            },
        }
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        let frames = self.parser.feed(chunk);
        self.record(frames);
    }

    pub fn finish(mut self) -> StreamSummary {
        let frames = self.parser.finish();
        self.record(frames);
        self.summary
    }

    fn record(&mut self, frames: Vec<Result<StreamFrame, parser::FrameError>>) {
        for frame in frames {
            match frame {
                Ok(StreamFrame::ThreadId(id)) => {
                    if self.summary.thread_id.is_none() {
                        debug!("Latched thread id {}", id);
                        self.summary.thread_id = Some(id);
                    }
                }
                Ok(StreamFrame::Chunk(_)) => {
                    self.summary.chunks += 1;
                }
                Ok(StreamFrame::Done) => {
                    self.summary.done = true;
                }
                Ok(StreamFrame::Error(message)) => {
                    warn!("Upstream reported a stream error: {}", message);
                    self.summary.error = Some(message);
                }
                Err(e) => {
                    debug!("Ignoring stream event: {}", e);
                    self.summary.bad_events += 1;
                }
            }
        }
    }
}

pub struct Relay {
    pub body: ReceiverStream<Result<Bytes, UpstreamError>>,
    pub task: JoinHandle<StreamSummary>,
}

/// Starts relaying `upstream`. The returned body yields exactly the upstream
/// bytes, in order, and ends with an `Err` if the upstream read fails.
pub fn relay(
    upstream: ByteStream,
    request_thread_id: Option<String>,
    reconciler: Option<CompletionReconciler>
) -> Relay {
    let (tx, rx) = mpsc::channel(RELAY_BUFFER);

    let task = tokio::spawn(async move {
        let mut upstream = upstream;
        let mut tap = StreamTap::new(request_thread_id);
        let mut aborted = false;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    if tx.send(Ok(chunk.clone())).await.is_err() {
                        info!("Client went away, stopping relay");
                        aborted = true;
                        break;
                    }
                    tap.observe(&chunk);
                }
                Err(e) => {
                    warn!("Upstream stream failed: {}", e);
                    let _ = tx.send(Err(e)).await;
                    aborted = true;
                    break;
                }
            }
        }
        drop(tx);

        let mut summary = tap.finish();
        summary.aborted = aborted;
        debug!(
            "Relay finished: thread={:?} chunks={} done={} aborted={}",
            summary.thread_id,
            summary.chunks,
            summary.done,
            summary.aborted
        );

        if let (Some(reconciler), Some(thread_id)) = (reconciler, summary.thread_id.clone()) {
            if summary.completed() {
                reconciler.reconcile(&thread_id).await;
            }
        }
        summary
    });

    Relay {
        body: ReceiverStream::new(rx),
        task,
    }
}
