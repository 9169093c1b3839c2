use std::collections::VecDeque;

use thiserror::Error;
use tokio::sync::mpsc;
use wayfarer_core::{FinishReason, StreamEvent, StreamEventKind, ToolCallRequest, ToolInvocation};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("stream consumer disconnected")]
    Disconnected,
    #[error("stream already finished")]
    Finished,
    #[error("out-of-order event: {0}")]
    OutOfOrder(String),
    #[error("language model failed: {0}")]
    Model(String),
}

/// Writes the turn's events to the client in causal order.
///
/// Every tool call is held open until its result is written; text written
/// while a call is open, or a result for any call other than the oldest
/// open one, is refused. The finish marker closes the stream for good.
#[derive(Debug)]
pub struct StreamComposer {
    sender: mpsc::Sender<StreamEvent>,
    next_seq: u64,
    open_calls: VecDeque<String>,
    finished: bool,
}

impl StreamComposer {
    pub fn new(sender: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            sender,
            next_seq: 0,
            open_calls: VecDeque::new(),
            finished: false,
        }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.len()
    }

    pub async fn text(&mut self, text: &str) -> Result<(), StreamError> {
        if let Some(call_id) = self.open_calls.front() {
            return Err(StreamError::OutOfOrder(format!(
                "text emitted while tool call {call_id} awaits its result"
            )));
        }
        if text.is_empty() {
            return Ok(());
        }
        self.emit(StreamEventKind::TextDelta {
            text: text.to_string(),
        })
        .await
    }

    pub async fn tool_call(&mut self, call: &ToolCallRequest) -> Result<(), StreamError> {
        self.ensure_open()?;
        self.open_calls.push_back(call.call_id.clone());
        self.emit(StreamEventKind::ToolCall { call: call.clone() }).await
    }

    pub async fn tool_result(&mut self, invocation: &ToolInvocation) -> Result<(), StreamError> {
        self.ensure_open()?;
        match self.open_calls.front() {
            Some(call_id) if call_id == &invocation.call_id => {
                self.open_calls.pop_front();
            }
            Some(call_id) => {
                return Err(StreamError::OutOfOrder(format!(
                    "result for {} arrived before result for {call_id}",
                    invocation.call_id
                )));
            }
            None => {
                return Err(StreamError::OutOfOrder(format!(
                    "result for {} has no matching call",
                    invocation.call_id
                )));
            }
        }
        self.emit(StreamEventKind::ToolResult {
            invocation: invocation.clone(),
        })
        .await
    }

    pub async fn error(&mut self, message: impl Into<String>) -> Result<(), StreamError> {
        self.emit(StreamEventKind::Error {
            message: message.into(),
        })
        .await
    }

    /// Writes the single finish marker. Calls still open at this point are
    /// abandoned.
    pub async fn finish(&mut self, reason: FinishReason) -> Result<(), StreamError> {
        self.ensure_open()?;
        self.open_calls.clear();
        let sent = self.emit(StreamEventKind::Finish { reason }).await;
        self.finished = true;
        sent
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.finished {
            Err(StreamError::Finished)
        } else {
            Ok(())
        }
    }

    async fn emit(&mut self, kind: StreamEventKind) -> Result<(), StreamError> {
        self.ensure_open()?;
        let event = StreamEvent {
            seq: self.next_seq,
            kind,
        };
        self.next_seq += 1;
        self.sender
            .send(event)
            .await
            .map_err(|_| StreamError::Disconnected)
    }
}
