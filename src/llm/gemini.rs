use super::{require_key, LlmError, ProviderKind, ProviderRequest};
use crate::db::models::Role;
use crate::stream::{EventFramedDecoder, Frame, StreamDecoder, Strictness};
use crate::transport::HttpRequest;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystem>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystem {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    InlineData { inline_data: InlineData },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        _ => "model",
    }
}

fn build_body(request: &ProviderRequest) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| GeminiContent {
            role: gemini_role(m.role),
            parts: vec![GeminiPart::Text {
                text: m.content.clone(),
            }],
        })
        .collect();

    if let (Some(image), Some(last)) = (&request.image, contents.last_mut()) {
        last.parts.insert(
            0,
            GeminiPart::InlineData {
                inline_data: InlineData {
                    mime_type: image.mime_type.clone(),
                    data: image.data.clone(),
                },
            },
        );
    }

    GeminiRequest {
        contents,
        system_instruction: request.system.as_ref().map(|system| GeminiSystem {
            parts: vec![GeminiPart::Text {
                text: system.clone(),
            }],
        }),
    }
}

pub fn http_request(
    config: &GeminiConfig,
    request: &ProviderRequest,
    stream: bool,
) -> Result<HttpRequest, LlmError> {
    let api_key = require_key(ProviderKind::Gemini, &config.api_key)?;
    let base = config.base_url.trim_end_matches('/');
    let url = if stream {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            base, request.model, api_key
        )
    } else {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            base, request.model, api_key
        )
    };

    Ok(HttpRequest {
        url,
        headers: Vec::new(),
        body: serde_json::to_value(build_body(request))?,
    })
}

/// Text of every part of the candidate, in order.
fn candidate_text(candidate: &GeminiCandidate) -> Option<String> {
    let parts = &candidate.content.as_ref()?.parts;
    let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
    Some(text)
}

pub fn extract_content(raw: &str) -> Result<String, LlmError> {
    let data: GeminiResponse =
        serde_json::from_str(raw).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
    data.candidates
        .first()
        .and_then(candidate_text)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| LlmError::MalformedResponse("no text in candidates[0].content".into()))
}

/// One `GenerateContentResponse` chunk from the `alt=sse` stream. The stream
/// has no end marker; the candidate's `finishReason` closes it.
pub fn parse_stream_payload(data: &str) -> Result<Frame, String> {
    let chunk: GeminiResponse = serde_json::from_str(data).map_err(|e| e.to_string())?;
    if let Some(error) = chunk.error {
        return Ok(Frame::error(error.message));
    }
    let Some(candidate) = chunk.candidates.first() else {
        return Ok(Frame::skip());
    };
    Ok(Frame {
        text: candidate_text(candidate),
        done: candidate.finish_reason.is_some(),
        error: None,
    })
}

pub fn decoder(strictness: Strictness) -> Box<dyn StreamDecoder> {
    Box::new(EventFramedDecoder::new(parse_stream_payload, strictness))
}
