pub mod claude;
pub mod gemini;
pub mod openai;

use crate::db::models::Role;
use crate::stream::{delta_stream, DeltaStream, StreamDecoder, Strictness};
use crate::transport::{HttpRequest, Transport};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Text committed when a successful response has no readable content.
pub const NO_CONTENT_FALLBACK: &str = "No response content found";

/// Prompt sent when the user attaches an image without typing anything.
pub const DEFAULT_IMAGE_PROMPT: &str = "Analyze this image";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Image bytes ready to be embedded in a request body.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub mime_type: String,
    /// Standard base64, no data-URL prefix.
    pub data: String,
}

impl InlineImage {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: BASE64.encode(bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentText {
    pub filename: String,
    pub text: String,
}

impl DocumentText {
    pub(crate) fn render(&self) -> String {
        format!(
            "<document name=\"{}\">\n{}\n</document>",
            self.filename,
            self.text.trim_end()
        )
    }
}

/// The new user submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserTurn {
    pub prompt: String,
    pub image: Option<InlineImage>,
    pub document: Option<DocumentText>,
}

impl UserTurn {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: InlineImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_document(mut self, document: DocumentText) -> Self {
        self.document = Some(document);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    OpenRouter,
    Claude,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAi,
        ProviderKind::OpenRouter,
        ProviderKind::Claude,
        ProviderKind::Gemini,
    ];

    /// Prefix used in `provider/model` strings.
    pub fn prefix(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::OpenRouter => "OpenRouter",
            ProviderKind::Claude => "Anthropic",
            ProviderKind::Gemini => "Google Gemini",
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
            ProviderKind::Claude => "ANTHROPIC_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Claude => "https://api.anthropic.com",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == prefix)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Vendor-neutral request for one call, built fresh per submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub provider: ProviderKind,
    pub model: String,
    /// Oldest first; the last entry is the new user turn.
    pub messages: Vec<ChatMessage>,
    /// Attached to the last message when rendered.
    pub image: Option<InlineImage>,
    pub system: Option<String>,
}

impl ProviderRequest {
    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system.filter(|s| !s.trim().is_empty());
        self
    }
}

/// Assembles the normalized request for `provider`: `history` (oldest first)
/// followed by the new user turn.
pub fn build_request(
    provider: ProviderKind,
    model: &str,
    history: &[ChatMessage],
    turn: UserTurn,
) -> Result<ProviderRequest, LlmError> {
    let UserTurn {
        prompt,
        image,
        document,
    } = turn;

    let prompt_blank = prompt.trim().is_empty();
    if prompt_blank && image.is_none() && document.is_none() {
        return Err(LlmError::EmptyPrompt);
    }

    let mut content = match (&image, prompt_blank) {
        (Some(_), true) => DEFAULT_IMAGE_PROMPT.to_string(),
        (_, true) => String::new(),
        (_, false) => prompt,
    };
    if let Some(document) = &document {
        if !content.is_empty() {
            content.push_str("\n\n");
        }
        content.push_str(&document.render());
    }

    let mut messages: Vec<ChatMessage> = history
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();
    messages.push(ChatMessage::user(content));

    Ok(ProviderRequest {
        provider,
        model: model.to_string(),
        messages,
        image,
        system: None,
    })
}

/// One variant per vendor API.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    /// OpenAI-compatible gateway, used for DeepSeek.
    OpenRouter(openai::OpenAiConfig),
    Claude(claude::ClaudeConfig),
    Gemini(gemini::GeminiConfig),
}

impl Provider {
    pub fn openai(api_key: Option<String>) -> Self {
        Provider::OpenAi(openai::OpenAiConfig {
            api_key,
            base_url: ProviderKind::OpenAi.default_base_url().to_string(),
        })
    }

    pub fn openrouter(api_key: Option<String>) -> Self {
        Provider::OpenRouter(openai::OpenAiConfig {
            api_key,
            base_url: ProviderKind::OpenRouter.default_base_url().to_string(),
        })
    }

    pub fn claude(api_key: Option<String>) -> Self {
        Provider::Claude(claude::ClaudeConfig {
            api_key,
            base_url: ProviderKind::Claude.default_base_url().to_string(),
            max_tokens: claude::DEFAULT_MAX_TOKENS,
        })
    }

    pub fn gemini(api_key: Option<String>) -> Self {
        Provider::Gemini(gemini::GeminiConfig {
            api_key,
            base_url: ProviderKind::Gemini.default_base_url().to_string(),
        })
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::OpenAi(_) => ProviderKind::OpenAi,
            Provider::OpenRouter(_) => ProviderKind::OpenRouter,
            Provider::Claude(_) => ProviderKind::Claude,
            Provider::Gemini(_) => ProviderKind::Gemini,
        }
    }

    /// Renders the vendor HTTP request for `request`.
    pub fn http_request(
        &self,
        request: &ProviderRequest,
        stream: bool,
    ) -> Result<HttpRequest, LlmError> {
        if request.provider != self.kind() {
            return Err(LlmError::Configuration(format!(
                "request built for {} sent to {}",
                request.provider,
                self.kind()
            )));
        }
        match self {
            Provider::OpenAi(config) | Provider::OpenRouter(config) => {
                openai::http_request(self.kind(), config, request, stream)
            }
            Provider::Claude(config) => claude::http_request(config, request, stream),
            Provider::Gemini(config) => gemini::http_request(config, request, stream),
        }
    }

    /// Reads the answer text out of a non-streaming response body.
    pub fn extract_content(&self, raw: &str) -> Result<String, LlmError> {
        match self {
            Provider::OpenAi(_) | Provider::OpenRouter(_) => openai::extract_content(raw),
            Provider::Claude(_) => claude::extract_content(raw),
            Provider::Gemini(_) => gemini::extract_content(raw),
        }
    }

    /// Like [`Provider::extract_content`] but degrades to
    /// [`NO_CONTENT_FALLBACK`] when the body has no readable content.
    pub fn parse_response(&self, raw: &str) -> String {
        match self.extract_content(raw) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(provider = %self.kind(), error = %e, "using fallback content");
                NO_CONTENT_FALLBACK.to_string()
            }
        }
    }

    /// A fresh decoder for one streamed response from this provider. Vendor
    /// payloads are decoded strictly unless `strictness` says otherwise.
    pub fn decoder(&self, strictness: Option<Strictness>) -> Box<dyn StreamDecoder> {
        let strictness = strictness.unwrap_or(Strictness::Strict);
        match self {
            Provider::OpenAi(_) | Provider::OpenRouter(_) => openai::decoder(strictness),
            Provider::Claude(_) => claude::decoder(strictness),
            Provider::Gemini(_) => gemini::decoder(strictness),
        }
    }

    pub async fn chat(
        &self,
        transport: &dyn Transport,
        request: &ProviderRequest,
    ) -> Result<String, LlmError> {
        let http = self.http_request(request, false)?;
        let resp = transport.send(http).await?;
        let status = resp.status;
        let success = resp.is_success();
        let body = resp.text().await?;
        if !success {
            return Err(upstream_error(status, &body));
        }
        Ok(self.parse_response(&body))
    }

    /// Sends a streaming request and returns its deltas. Cancelling `cancel`
    /// drops the connection.
    pub async fn chat_stream(
        &self,
        transport: &dyn Transport,
        request: &ProviderRequest,
        strictness: Option<Strictness>,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, LlmError> {
        let http = self.http_request(request, true)?;
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(LlmError::Cancelled { partial: String::new() });
            }
            resp = transport.send(http) => resp?,
        };
        if !resp.is_success() {
            let status = resp.status;
            let body = resp.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }
        Ok(delta_stream(resp.body, self.decoder(strictness), cancel))
    }
}

/// Applies per-model cleanup to a finished answer.
pub fn postprocess(provider: ProviderKind, model: &str, text: &str) -> String {
    if provider == ProviderKind::OpenRouter && model.starts_with("deepseek/") {
        // R1-zero wraps answers in LaTeX boxes.
        return text.replace("\\boxed{", "").replace('}', "").trim().to_string();
    }
    text.to_string()
}

pub(crate) fn require_key(kind: ProviderKind, api_key: &Option<String>) -> Result<&str, LlmError> {
    match api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(LlmError::Configuration(format!(
            "{} API key not configured (set {})",
            kind.display_name(),
            kind.api_key_env()
        ))),
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Builds the upstream error for a non-success status, preferring the
/// vendor's `error.message`.
pub(crate) fn upstream_error(status: u16, body: &str) -> LlmError {
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) if !body.trim().is_empty() => body.trim().to_string(),
        Err(_) => format!("API request failed with status {}", status),
    };
    LlmError::Upstream { status, message }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("API error: {status} - {message}")]
    Upstream { status: u16, message: String },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("API error: {message}")]
    StreamError { message: String, partial: String },
    #[error("Stream ended before completion")]
    TruncatedStream { partial: String },
    #[error("Stream cancelled")]
    Cancelled { partial: String },
    #[error("Prompt is empty and nothing is attached")]
    EmptyPrompt,
}
