use super::{DecoderState, StreamDecoder, StreamDelta};
use crate::llm::LlmError;

/// Raw text body that ends at the first occurrence of a sentinel string.
pub struct SentinelDecoder {
    sentinel: String,
    /// Bytes of a UTF-8 sequence cut by a chunk boundary.
    utf8_tail: Vec<u8>,
    /// Decoded text that might be the start of the sentinel.
    held: String,
    state: DecoderState,
}

impl SentinelDecoder {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            utf8_tail: Vec::new(),
            held: String::new(),
            state: DecoderState::new(),
        }
    }

    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(chunk);

        let mut text = String::with_capacity(bytes.len());
        let mut rest = &bytes[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // `valid` was just checked.
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.utf8_tail = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    /// Length of the longest proper suffix of `held` that starts the sentinel.
    fn partial_sentinel_len(&self) -> usize {
        let max = self.sentinel.len().saturating_sub(1).min(self.held.len());
        (1..=max)
            .rev()
            .find(|&len| {
                let start = self.held.len() - len;
                self.held.is_char_boundary(start) && self.sentinel.starts_with(&self.held[start..])
            })
            .unwrap_or(0)
    }
}

impl StreamDecoder for SentinelDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if !self.state.is_open() {
            return out;
        }
        let text = self.decode_utf8(chunk);
        self.held.push_str(&text);

        if let Some(idx) = self.held.find(&self.sentinel) {
            let before = self.held[..idx].to_string();
            self.held.clear();
            self.utf8_tail.clear();
            self.state.emit(&before, &mut out);
            self.state.complete(&mut out);
            return out;
        }

        let split = self.held.len() - self.partial_sentinel_len();
        let ready: String = self.held.drain(..split).collect();
        self.state.emit(&ready, &mut out);
        out
    }

    fn flush(&mut self) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if !self.state.is_open() {
            return out;
        }
        let mut rest = std::mem::take(&mut self.held);
        if !self.utf8_tail.is_empty() {
            self.utf8_tail.clear();
            rest.push(char::REPLACEMENT_CHARACTER);
        }
        self.state.emit(&rest, &mut out);
        out
    }

    fn cancel(&mut self) {
        self.state.cancel();
        self.held.clear();
        self.utf8_tail.clear();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DONE_SENTINEL;

    fn collect_text(deltas: &[StreamDelta]) -> String {
        deltas.iter().map(|d| d.text.as_str()).collect()
    }

    #[test]
    fn test_text_after_sentinel_is_never_emitted() {
        let mut decoder = SentinelDecoder::new(DONE_SENTINEL);
        let deltas = decoder.decode(b"partial answer[DONE]ignored tail");
        assert_eq!(
            deltas,
            vec![StreamDelta::text("partial answer"), StreamDelta::done()]
        );
        assert!(decoder.decode(b"more").is_empty());
        assert_eq!(decoder.outcome().unwrap(), "partial answer");
    }

    #[test]
    fn test_sentinel_split_across_chunks() {
        let mut decoder = SentinelDecoder::new(DONE_SENTINEL);
        let mut deltas = decoder.decode(b"abc[DO");
        assert_eq!(deltas, vec![StreamDelta::text("abc")]);
        deltas.extend(decoder.decode(b"NE]xyz"));
        assert_eq!(collect_text(&deltas), "abc");
        assert!(deltas.last().unwrap().is_final);
    }

    #[test]
    fn test_false_sentinel_prefix_is_released() {
        let mut decoder = SentinelDecoder::new(DONE_SENTINEL);
        let mut deltas = decoder.decode(b"array[D");
        deltas.extend(decoder.decode(b"] done"));
        assert_eq!(collect_text(&deltas), "array[D] done");
        assert!(!decoder.is_finished());
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let text = "caf\u{e9} \u{4e2d}\u{6587}".as_bytes();
        let mut decoder = SentinelDecoder::new(DONE_SENTINEL);
        let mut deltas = Vec::new();
        for byte in text {
            deltas.extend(decoder.decode(std::slice::from_ref(byte)));
        }
        assert_eq!(collect_text(&deltas), "caf\u{e9} \u{4e2d}\u{6587}");
        assert!(deltas.iter().all(|d| !d.text.contains('\u{fffd}')));
    }

    #[test]
    fn test_invalid_bytes_become_replacement_characters() {
        let mut decoder = SentinelDecoder::new(DONE_SENTINEL);
        let deltas = decoder.decode(b"a\xffb");
        assert_eq!(collect_text(&deltas), "a\u{fffd}b");
    }

    #[test]
    fn test_end_without_sentinel_is_truncated() {
        let mut decoder = SentinelDecoder::new(DONE_SENTINEL);
        let mut deltas = decoder.decode(b"half an answer [");
        deltas.extend(decoder.flush());
        assert_eq!(collect_text(&deltas), "half an answer [");
        match decoder.outcome() {
            Err(LlmError::TruncatedStream { partial }) => assert_eq!(partial, "half an answer ["),
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_drops_held_text() {
        let mut decoder = SentinelDecoder::new(DONE_SENTINEL);
        decoder.decode(b"kept[DON");
        decoder.cancel();
        assert!(decoder.decode(b"E]").is_empty());
        assert!(decoder.flush().is_empty());
        assert_eq!(decoder.text(), "kept");
    }
}
