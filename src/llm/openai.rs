use super::{require_key, LlmError, ProviderKind, ProviderRequest};
use crate::db::models::Role;
use crate::stream::{EventFramedDecoder, Frame, StreamDecoder, Strictness};
use crate::transport::HttpRequest;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: OpenAiContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    error: Option<OpenAiStreamError>,
}

#[derive(Deserialize)]
struct OpenAiStreamError {
    message: String,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

fn build_body(request: &ProviderRequest, stream: bool) -> OpenAiRequest {
    let mut messages: Vec<OpenAiMessage> = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(OpenAiMessage {
            role: Role::System.as_str(),
            content: OpenAiContent::Text(system.clone()),
        });
    }
    messages.extend(request.messages.iter().map(|m| OpenAiMessage {
        role: m.role.as_str(),
        content: OpenAiContent::Text(m.content.clone()),
    }));

    if let (Some(image), Some(last)) = (&request.image, messages.last_mut()) {
        let text = match &last.content {
            OpenAiContent::Text(text) => text.clone(),
            OpenAiContent::Parts(_) => String::new(),
        };
        last.content = OpenAiContent::Parts(vec![
            OpenAiPart::Text { text },
            OpenAiPart::ImageUrl {
                image_url: ImageUrl {
                    url: image.data_url(),
                },
            },
        ]);
    }

    OpenAiRequest {
        model: request.model.clone(),
        messages,
        stream,
    }
}

pub fn http_request(
    kind: ProviderKind,
    config: &OpenAiConfig,
    request: &ProviderRequest,
    stream: bool,
) -> Result<HttpRequest, LlmError> {
    let api_key = require_key(kind, &config.api_key)?;
    let mut headers = vec![("Authorization".to_string(), format!("Bearer {}", api_key))];
    if kind == ProviderKind::OpenRouter {
        headers.push(("X-Title".to_string(), "polychat".to_string()));
    }

    Ok(HttpRequest {
        url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
        headers,
        body: serde_json::to_value(build_body(request, stream))?,
    })
}

pub fn extract_content(raw: &str) -> Result<String, LlmError> {
    let data: OpenAiResponse =
        serde_json::from_str(raw).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
    data.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| LlmError::MalformedResponse("missing choices[0].message.content".into()))
}

/// One `chat.completion.chunk` payload. `[DONE]` is handled by the framing.
pub fn parse_stream_payload(data: &str) -> Result<Frame, String> {
    let parsed: OpenAiStreamResponse = serde_json::from_str(data).map_err(|e| e.to_string())?;
    if let Some(error) = parsed.error {
        return Ok(Frame::error(error.message));
    }
    let Some(choice) = parsed.choices.into_iter().next() else {
        // Usage-only chunks carry no choices.
        return Ok(Frame::skip());
    };
    Ok(Frame {
        text: choice.delta.content,
        done: choice.finish_reason.is_some(),
        error: None,
    })
}

pub fn decoder(strictness: Strictness) -> Box<dyn StreamDecoder> {
    Box::new(EventFramedDecoder::new(parse_stream_payload, strictness))
}
