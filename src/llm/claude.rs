use super::{require_key, LlmError, ProviderKind, ProviderRequest};
use crate::db::models::Role;
use crate::stream::{EventFramedDecoder, Frame, StreamDecoder, Strictness};
use crate::transport::HttpRequest;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub max_tokens: u32,
}

#[derive(Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ClaudeMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize)]
struct ClaudeMessage {
    role: &'static str,
    content: ClaudeContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ClaudeContent {
    Text(String),
    Blocks(Vec<ClaudeBlock>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeBlock {
    Image { source: ImageSource },
    Text { text: String },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeResponseBlock>,
}

#[derive(Deserialize)]
struct ClaudeResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ClaudeStreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ClaudeDelta },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "error")]
    Error { error: ClaudeStreamError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ClaudeDelta {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ClaudeStreamError {
    message: String,
}

fn build_body(config: &ClaudeConfig, request: &ProviderRequest, stream: bool) -> ClaudeRequest {
    let mut messages: Vec<ClaudeMessage> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| ClaudeMessage {
            role: m.role.as_str(),
            content: ClaudeContent::Text(m.content.clone()),
        })
        .collect();

    if let (Some(image), Some(last)) = (&request.image, messages.last_mut()) {
        let text = match &last.content {
            ClaudeContent::Text(text) => text.clone(),
            ClaudeContent::Blocks(_) => String::new(),
        };
        last.content = ClaudeContent::Blocks(vec![
            ClaudeBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: image.mime_type.clone(),
                    data: image.data.clone(),
                },
            },
            ClaudeBlock::Text { text },
        ]);
    }

    ClaudeRequest {
        model: request.model.clone(),
        max_tokens: config.max_tokens,
        messages,
        stream,
        system: request.system.clone(),
    }
}

pub fn http_request(
    config: &ClaudeConfig,
    request: &ProviderRequest,
    stream: bool,
) -> Result<HttpRequest, LlmError> {
    let api_key = require_key(ProviderKind::Claude, &config.api_key)?;
    Ok(HttpRequest {
        url: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
        headers: vec![
            ("x-api-key".to_string(), api_key.to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ],
        body: serde_json::to_value(build_body(config, request, stream))?,
    })
}

pub fn extract_content(raw: &str) -> Result<String, LlmError> {
    let data: ClaudeResponse =
        serde_json::from_str(raw).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
    data.content
        .into_iter()
        .find(|block| block.kind == "text")
        .and_then(|block| block.text)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| LlmError::MalformedResponse("no text block in content".into()))
}

pub fn parse_stream_payload(data: &str) -> Result<Frame, String> {
    let event: ClaudeStreamEvent = serde_json::from_str(data).map_err(|e| e.to_string())?;
    match event {
        ClaudeStreamEvent::ContentBlockDelta { delta } => Ok(Frame {
            text: delta.text,
            ..Frame::default()
        }),
        ClaudeStreamEvent::MessageStop {} => Ok(Frame::done()),
        ClaudeStreamEvent::Error { error } => Ok(Frame::error(error.message)),
        ClaudeStreamEvent::Other => Ok(Frame::skip()),
    }
}

pub fn decoder(strictness: Strictness) -> Box<dyn StreamDecoder> {
    Box::new(EventFramedDecoder::new(parse_stream_payload, strictness))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{build_request, ChatMessage, InlineImage, UserTurn};
    use crate::stream::StreamDelta;

    fn config() -> ClaudeConfig {
        ClaudeConfig {
            api_key: Some("sk-ant".into()),
            base_url: "https://api.anthropic.com".into(),
            max_tokens: 1024,
        }
    }

    #[test]
    fn test_system_prompt_is_lifted_out_of_messages() {
        let history = vec![ChatMessage::user("q"), ChatMessage::assistant("a")];
        let request = build_request(
            ProviderKind::Claude,
            "claude-sonnet-4-20250514",
            &history,
            UserTurn::text("next"),
        )
        .unwrap()
        .with_system(Some("You are terse.".into()));

        let http = http_request(&config(), &request, true).unwrap();
        assert_eq!(http.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(http.header("x-api-key"), Some("sk-ant"));
        assert_eq!(http.header("anthropic-version"), Some("2023-06-01"));
        assert_eq!(http.body["system"], "You are terse.");
        assert_eq!(http.body["max_tokens"], 1024);
        let roles: Vec<&str> = http.body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
    }

    #[test]
    fn test_no_system_field_when_absent() {
        let request = build_request(ProviderKind::Claude, "c", &[], UserTurn::text("hi")).unwrap();
        let http = http_request(&config(), &request, false).unwrap();
        assert!(http.body.get("system").is_none());
    }

    #[test]
    fn test_image_block_precedes_text() {
        let turn = UserTurn::text("describe")
            .with_image(InlineImage::from_bytes("image/png", b"jpg"));
        let request = build_request(ProviderKind::Claude, "c", &[], turn).unwrap();
        let http = http_request(&config(), &request, false).unwrap();
        assert_eq!(
            http.body["messages"][0]["content"],
            serde_json::json!([
                {
                    "type": "image",
                    "source": {"type": "base64", "media_type": "image/png", "data": "anBn"}
                },
                {"type": "text", "text": "describe"},
            ])
        );
    }

    #[test]
    fn test_extract_content_skips_non_text_blocks() {
        let raw = serde_json::json!({
            "content": [
                { "type": "thinking", "thinking": "hmm" },
                { "type": "text", "text": "Answer" }
            ]
        })
        .to_string();
        assert_eq!(extract_content(&raw).unwrap(), "Answer");
        assert!(extract_content(r#"{"content":[]}"#).is_err());
    }

    #[test]
    fn test_stream_payloads() {
        let delta =
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(parse_stream_payload(delta).unwrap(), Frame::text("Hi"));
        assert_eq!(
            parse_stream_payload(r#"{"type":"message_stop"}"#).unwrap(),
            Frame::done()
        );
        assert_eq!(
            parse_stream_payload(r#"{"type":"ping"}"#).unwrap(),
            Frame::skip()
        );
        let error =
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(
            parse_stream_payload(error).unwrap(),
            Frame::error("Overloaded")
        );
        assert!(parse_stream_payload(r#"{"type":"content_block_delta""#).is_err());
    }

    #[test]
    fn test_error_event_fails_the_stream() {
        for strictness in [Strictness::Strict, Strictness::Lenient] {
            let mut decoder = decoder(strictness);
            let mut deltas = decoder.decode(
                b"event: content_block_delta\n\
                  data: {\"type\":\"content_block_delta\",\"index\":0,\
                  \"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            );
            deltas.extend(decoder.decode(
                b"event: error\n\
                  data: {\"type\":\"error\",\"error\":\
                  {\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
            ));
            assert_eq!(deltas, vec![StreamDelta::text("Hi")]);
            assert!(decoder.is_finished());
            assert!(matches!(
                decoder.outcome(),
                Err(LlmError::StreamError { message, partial })
                    if message == "Overloaded" && partial == "Hi"
            ));
        }
    }
}
