use super::{DecoderState, StreamDecoder, StreamDelta, Strictness, DONE_SENTINEL};
use crate::llm::LlmError;

/// What a single event payload contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub text: Option<String>,
    /// The provider marked this payload as the last one.
    pub done: bool,
    /// The provider reported a failure inside the stream.
    pub error: Option<String>,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn skip() -> Self {
        Self::default()
    }
}

/// Decodes one payload. `Err` carries a description of why it could not be
/// understood.
pub type PayloadParser = fn(&str) -> Result<Frame, String>;

/// Payload is a JSON string literal holding the fragment verbatim.
pub fn json_text_payload(data: &str) -> Result<Frame, String> {
    serde_json::from_str::<String>(data)
        .map(Frame::text)
        .map_err(|e| e.to_string())
}

/// Line-oriented event decoding: every `data:` line carries one payload.
pub struct EventFramedDecoder {
    prefix: &'static str,
    sentinel: String,
    parser: PayloadParser,
    strictness: Strictness,
    buffer: Vec<u8>,
    malformed: usize,
    state: DecoderState,
}

impl EventFramedDecoder {
    pub fn new(parser: PayloadParser, strictness: Strictness) -> Self {
        Self {
            prefix: "data:",
            sentinel: DONE_SENTINEL.to_string(),
            parser,
            strictness,
            buffer: Vec::new(),
            malformed: 0,
            state: DecoderState::new(),
        }
    }

    /// Payloads are JSON-encoded strings, raw text on decode failure.
    pub fn json_text() -> Self {
        Self::new(json_text_payload, Strictness::Lenient)
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    /// Payloads dropped in strict mode because they could not be decoded.
    pub fn malformed_frames(&self) -> usize {
        self.malformed
    }

    fn process_line(&mut self, raw: &[u8], out: &mut Vec<StreamDelta>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.strip_suffix('\r').unwrap_or(&line);
        let Some(data) = line.strip_prefix(self.prefix) else {
            return;
        };
        // A single space after the colon belongs to the framing.
        let data = data.strip_prefix(' ').unwrap_or(data);

        if data == self.sentinel {
            self.state.complete(out);
            return;
        }

        match (self.parser)(data) {
            Ok(Frame {
                error: Some(message),
                ..
            }) => {
                tracing::warn!(%message, "provider reported an error mid-stream");
                self.state.fail(message);
            }
            Ok(frame) => {
                if let Some(text) = frame.text {
                    if text == self.sentinel {
                        self.state.complete(out);
                        return;
                    }
                    self.state.emit(&text, out);
                }
                if frame.done {
                    self.state.complete(out);
                }
            }
            Err(reason) => match self.strictness {
                Strictness::Lenient => {
                    tracing::debug!(%reason, "undecodable payload, using raw text");
                    self.state.emit(data, out);
                }
                Strictness::Strict => {
                    self.malformed += 1;
                    tracing::warn!(
                        error = %LlmError::MalformedResponse(reason),
                        payload = data,
                        "dropping stream frame"
                    );
                }
            },
        }
    }
}

impl StreamDecoder for EventFramedDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if !self.state.is_open() {
            return out;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line[..pos], &mut out);
            if !self.state.is_open() {
                self.buffer.clear();
                break;
            }
        }
        out
    }

    fn flush(&mut self) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if self.state.is_open() && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line, &mut out);
        }
        out
    }

    fn cancel(&mut self) {
        self.state.cancel();
        self.buffer.clear();
    }

    fn is_finished(&self) -> bool {
        !self.state.is_open()
    }

    fn text(&self) -> &str {
        self.state.text()
    }

    fn outcome(&self) -> Result<String, LlmError> {
        self.state.outcome()
    }
}
