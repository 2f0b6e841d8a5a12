//! Incremental decoding of provider response bodies into text deltas.
//!
//! A decoder is fed raw byte chunks in arrival order and returns the deltas
//! those bytes complete. Two framings exist: [`EventFramedDecoder`] for
//! `data:`-prefixed event lines and [`SentinelDecoder`] for raw text that ends
//! with a marker. Providers pick one when a request is made; callers only see
//! the [`StreamDecoder`] trait. A decoder serves exactly one response.

pub mod event;
pub mod sentinel;

pub use event::{EventFramedDecoder, Frame, PayloadParser};
pub use sentinel::SentinelDecoder;

use crate::llm::LlmError;
use crate::transport::ByteStream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// Marker that ends a stream, both as an event payload and as raw text.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDelta {
    pub text: String,
    pub is_final: bool,
}

impl StreamDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn done() -> Self {
        Self {
            text: String::new(),
            is_final: true,
        }
    }
}

/// What to do with an event payload the parser cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Emit the raw payload text unchanged.
    Lenient,
    /// Drop the frame and log it as a malformed response.
    Strict,
}

pub trait StreamDecoder: Send {
    /// Feeds the next chunk of the body. Returns nothing once the stream has
    /// completed or been cancelled.
    fn decode(&mut self, chunk: &[u8]) -> Vec<StreamDelta>;

    /// Signals that the transport closed and drains whatever was held back.
    fn flush(&mut self) -> Vec<StreamDelta>;

    /// Stops all further emission, buffered bytes included.
    fn cancel(&mut self);

    /// True after the completion marker was seen or after cancellation.
    fn is_finished(&self) -> bool;

    /// All text emitted so far.
    fn text(&self) -> &str;

    /// Final result: the assembled text if completion was observed,
    /// otherwise `TruncatedStream` or `Cancelled` carrying the partial text.
    fn outcome(&self) -> Result<String, LlmError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Complete,
    Cancelled,
    Failed,
}

/// Bookkeeping shared by the decoder implementations.
#[derive(Debug)]
pub(crate) struct DecoderState {
    text: String,
    phase: Phase,
    error: Option<String>,
}

impl DecoderState {
    pub(crate) fn new() -> Self {
        Self {
            text: String::new(),
            phase: Phase::Open,
            error: None,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    pub(crate) fn emit(&mut self, text: &str, out: &mut Vec<StreamDelta>) {
        if text.is_empty() || !self.is_open() {
            return;
        }
        self.text.push_str(text);
        out.push(StreamDelta::text(text));
    }

    pub(crate) fn complete(&mut self, out: &mut Vec<StreamDelta>) {
        if self.is_open() {
            self.phase = Phase::Complete;
            out.push(StreamDelta::done());
        }
    }

    /// Ends the stream with an error reported by the provider.
    pub(crate) fn fail(&mut self, message: String) {
        if self.is_open() {
            self.phase = Phase::Failed;
            self.error = Some(message);
        }
    }

    pub(crate) fn cancel(&mut self) {
        if self.is_open() {
            self.phase = Phase::Cancelled;
        }
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn outcome(&self) -> Result<String, LlmError> {
        match self.phase {
            Phase::Complete => Ok(self.text.clone()),
            Phase::Cancelled => Err(LlmError::Cancelled {
                partial: self.text.clone(),
            }),
            Phase::Open => Err(LlmError::TruncatedStream {
                partial: self.text.clone(),
            }),
            Phase::Failed => Err(LlmError::StreamError {
                message: self.error.clone().unwrap_or_default(),
                partial: self.text.clone(),
            }),
        }
    }
}

pub type DeltaStream = BoxStream<'static, Result<StreamDelta, LlmError>>;

/// Drives `decoder` over `body`, yielding deltas lazily.
///
/// The body is dropped as soon as the decoder completes or `cancel` fires, so
/// the connection is released without waiting for the server. After
/// cancellation the stream yields a single `Cancelled` error and ends. If the
/// body ends before completion the last item is `TruncatedStream`.
pub fn delta_stream(
    body: ByteStream,
    decoder: Box<dyn StreamDecoder>,
    cancel: CancellationToken,
) -> DeltaStream {
    let pump = Pump {
        body: Some(body),
        decoder,
        pending: VecDeque::new(),
        cancel,
        flushed: false,
        done: false,
    };
    futures::stream::unfold(pump, |mut pump| async move {
        let item = pump.next_item().await?;
        Some((item, pump))
    })
    .boxed()
}

struct Pump {
    body: Option<ByteStream>,
    decoder: Box<dyn StreamDecoder>,
    pending: VecDeque<StreamDelta>,
    cancel: CancellationToken,
    flushed: bool,
    done: bool,
}

impl Pump {
    async fn next_item(&mut self) -> Option<Result<StreamDelta, LlmError>> {
        loop {
            if self.done {
                return None;
            }
            if self.cancel.is_cancelled() {
                return Some(self.abort());
            }
            if let Some(delta) = self.pending.pop_front() {
                self.done = delta.is_final;
                return Some(Ok(delta));
            }

            let Some(body) = self.body.as_mut() else {
                if !self.flushed {
                    self.flushed = true;
                    self.pending.extend(self.decoder.flush());
                    continue;
                }
                self.done = true;
                return self.decoder.outcome().err().map(Err);
            };

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = body.next() => Some(next),
            };
            let Some(next) = next else {
                return Some(self.abort());
            };

            match next {
                Some(Ok(chunk)) => {
                    self.pending.extend(self.decoder.decode(&chunk));
                    if self.decoder.is_finished() {
                        tracing::trace!("stream complete, releasing transport");
                        self.body = None;
                        self.flushed = true;
                    }
                }
                Some(Err(e)) => {
                    self.body = None;
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.body = None;
                }
            }
        }
    }

    fn abort(&mut self) -> Result<StreamDelta, LlmError> {
        tracing::debug!("stream cancelled by consumer");
        self.decoder.cancel();
        self.body = None;
        self.pending.clear();
        self.done = true;
        match self.decoder.outcome() {
            Err(e) => Err(e),
            // Completed just before the cancel landed; nothing left to report.
            Ok(text) => Err(LlmError::Cancelled { partial: text }),
        }
    }
}
