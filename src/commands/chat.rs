use crate::commands::settings::{get_available_models, CredentialSource, ModelInfo};
use crate::config::Settings;
use crate::conversation::storage::{AttachmentStore, StorageError};
use crate::conversation::{ConversationError, ConversationStore, NewMessage, StateEvent};
use crate::db::models::{
    Attachment, Conversation, ConversationId, ConversationSummary, Message, MessageId,
    MessageStatus, Role,
};
use crate::llm::{
    build_request, claude, gemini, openai, postprocess, ChatMessage, DocumentText, InlineImage,
    LlmError, Provider, ProviderKind, ProviderRequest, UserTurn,
};
use crate::stream::StreamDelta;
use crate::transport::Transport;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Stored content of a user turn that had only an image.
const IMAGE_ONLY_CONTENT: &str = "Image upload";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Resolve an LLM provider from a model string like "openai/gpt-4o",
/// "claude/...", "gemini/..." or "openrouter/deepseek/...". Unprefixed ids
/// go to OpenAI.
pub fn resolve_provider(
    model: &str,
    settings: &Settings,
    credentials: &dyn CredentialSource,
) -> (Provider, String) {
    let (kind, model_id) = match model.split_once('/') {
        Some((prefix, rest)) => match ProviderKind::from_prefix(prefix) {
            Some(kind) => (kind, rest),
            None => (ProviderKind::OpenAi, model),
        },
        None => (ProviderKind::OpenAi, model),
    };

    let api_key = credentials.api_key(kind);
    let endpoints = &settings.providers;
    let base_url = |configured: &Option<String>| {
        configured
            .clone()
            .unwrap_or_else(|| kind.default_base_url().to_string())
    };
    let provider = match kind {
        ProviderKind::OpenAi => Provider::OpenAi(openai::OpenAiConfig {
            api_key,
            base_url: base_url(&endpoints.openai.base_url),
        }),
        ProviderKind::OpenRouter => Provider::OpenRouter(openai::OpenAiConfig {
            api_key,
            base_url: base_url(&endpoints.openrouter.base_url),
        }),
        ProviderKind::Claude => Provider::Claude(claude::ClaudeConfig {
            api_key,
            base_url: base_url(&endpoints.claude.base_url),
            max_tokens: endpoints.claude.max_tokens,
        }),
        ProviderKind::Gemini => Provider::Gemini(gemini::GeminiConfig {
            api_key,
            base_url: base_url(&endpoints.gemini.base_url),
        }),
    };
    (provider, model_id.to_string())
}

/// One message from the user, with optional attachments.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Continues this conversation; a new one is started when `None`.
    pub conversation_id: Option<ConversationId>,
    pub prompt: String,
    /// `provider/model`; the configured default when `None`.
    pub model: Option<String>,
    pub image: Option<Attachment>,
    pub document: Option<Attachment>,
    pub stream: bool,
}

impl Submission {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            prompt: prompt.into(),
            model: None,
            image: None,
            document: None,
            stream: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: ConversationId,
    pub user_message_id: MessageId,
    /// The assistant message as it was left: complete, truncated or failed.
    pub reply: Message,
}

/// Runs chat turns against the configured providers and records them.
pub struct ChatService {
    store: Mutex<ConversationStore>,
    attachments: Arc<dyn AttachmentStore>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    settings: Settings,
}

impl ChatService {
    pub fn new(
        settings: Settings,
        store: ConversationStore,
        attachments: Arc<dyn AttachmentStore>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            attachments,
            transport,
            credentials,
            settings,
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, ConversationStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.lock_store().subscribe()
    }

    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        Ok(self.lock_store().list_conversations()?)
    }

    pub fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, ChatError> {
        let mut store = self.lock_store();
        store.open(id)?;
        Ok(store.conversation(id).cloned())
    }

    pub fn delete_conversation(&self, id: &ConversationId) -> Result<bool, ChatError> {
        Ok(self.lock_store().delete_conversation(id)?)
    }

    pub fn available_models(&self) -> Vec<ModelInfo> {
        get_available_models(self.credentials.as_ref())
    }

    /// Records the user turn, asks the model, and records its reply.
    /// `on_delta` sees each piece of the reply as it arrives.
    ///
    /// Only problems with the submission itself are returned as errors.
    /// Once the user turn is recorded, provider and stream failures end up
    /// in the reply's status instead.
    pub async fn send_message(
        &self,
        submission: Submission,
        cancel: CancellationToken,
        mut on_delta: impl FnMut(&StreamDelta),
    ) -> Result<TurnOutcome, ChatError> {
        let Submission {
            conversation_id,
            prompt,
            model,
            image,
            document,
            stream,
        } = submission;

        let model = model.unwrap_or_else(|| self.settings.default_model.clone());
        let (provider, model_id) =
            resolve_provider(&model, &self.settings, self.credentials.as_ref());
        let kind = provider.kind();
        let conversation_id = conversation_id.unwrap_or_default();

        let content = stored_content(&prompt, image.as_ref(), document.as_ref());
        let new_message = NewMessage {
            content,
            image: image.as_ref().map(|a| a.id.clone()),
            document: document.as_ref().map(|a| a.id.clone()),
            model: Some(format!("{}/{}", kind.prefix(), model_id)),
        };

        // History, request and reservation under one lock, so a concurrent
        // submitter is turned away before anything is written.
        let (history_len, request, turn) = {
            let mut store = self.lock_store();
            let history = if store.open(&conversation_id)? {
                let messages =
                    store.bounded_history(&conversation_id, self.settings.max_history)?;
                self.request_history(messages)
            } else {
                Vec::new()
            };
            let input = user_turn(&prompt, image.as_ref(), document.as_ref());
            let request = build_request(kind, &model_id, &history, input)?
                .with_system(self.settings.system_prompt.clone());
            let turn = store.append_user_turn(&conversation_id, new_message)?;
            (history.len(), request, turn)
        };
        let reply_id = turn.reply_id;

        if let Err(e) = self.store_attachments(image.iter().chain(document.iter())) {
            let mut store = self.lock_store();
            if let Err(close) = store.fail_turn(&conversation_id, &reply_id, e.to_string()) {
                tracing::warn!(message_id = %reply_id, error = %close, "could not close reply");
            }
            if let Err(save) = store.persist(&conversation_id) {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %save,
                    "failed to save conversation"
                );
            }
            return Err(e.into());
        }

        tracing::info!(
            conversation_id = %conversation_id,
            provider = %kind,
            model = %model_id,
            history = history_len,
            stream,
            "sending message"
        );

        let result = if stream {
            self.stream_reply(
                &provider,
                &request,
                &conversation_id,
                &reply_id,
                cancel,
                &mut on_delta,
            )
            .await
        } else {
            self.complete_reply(
                &provider,
                &request,
                &conversation_id,
                &reply_id,
                cancel,
                &mut on_delta,
            )
            .await
        };

        let reply = self.finish_turn(&conversation_id, &reply_id, kind, &model_id, result)?;
        Ok(TurnOutcome {
            conversation_id,
            user_message_id: turn.user_message_id,
            reply,
        })
    }

    fn store_attachments<'a>(
        &self,
        attachments: impl Iterator<Item = &'a Attachment>,
    ) -> Result<(), StorageError> {
        for attachment in attachments {
            self.attachments.put_attachment(attachment)?;
        }
        Ok(())
    }

    async fn stream_reply(
        &self,
        provider: &Provider,
        request: &ProviderRequest,
        conversation_id: &ConversationId,
        reply_id: &MessageId,
        cancel: CancellationToken,
        on_delta: &mut impl FnMut(&StreamDelta),
    ) -> Result<(), LlmError> {
        let mut deltas = provider
            .chat_stream(
                self.transport.as_ref(),
                request,
                self.settings.stream.strictness,
                cancel,
            )
            .await?;
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            self.apply_delta(conversation_id, reply_id, &delta);
            on_delta(&delta);
        }
        Ok(())
    }

    async fn complete_reply(
        &self,
        provider: &Provider,
        request: &ProviderRequest,
        conversation_id: &ConversationId,
        reply_id: &MessageId,
        cancel: CancellationToken,
        on_delta: &mut impl FnMut(&StreamDelta),
    ) -> Result<(), LlmError> {
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(LlmError::Cancelled { partial: String::new() });
            }
            text = provider.chat(self.transport.as_ref(), request) => text?,
        };
        for delta in [StreamDelta::text(text), StreamDelta::done()] {
            self.apply_delta(conversation_id, reply_id, &delta);
            on_delta(&delta);
        }
        Ok(())
    }

    fn apply_delta(
        &self,
        conversation_id: &ConversationId,
        reply_id: &MessageId,
        delta: &StreamDelta,
    ) {
        if let Err(e) = self
            .lock_store()
            .append_assistant_delta(conversation_id, reply_id, delta)
        {
            tracing::warn!(
                conversation_id = %conversation_id,
                message_id = %reply_id,
                error = %e,
                "dropping delta"
            );
        }
    }

    /// Closes the reply according to how the provider call ended, applies
    /// per-model cleanup, and writes the conversation through.
    fn finish_turn(
        &self,
        conversation_id: &ConversationId,
        reply_id: &MessageId,
        kind: ProviderKind,
        model_id: &str,
        result: Result<(), LlmError>,
    ) -> Result<Message, ChatError> {
        let mut store = self.lock_store();

        let closed = match result {
            Ok(()) => Ok(()),
            Err(LlmError::TruncatedStream { partial }) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    chars = partial.len(),
                    "stream ended before completion"
                );
                store.finalize_truncated(conversation_id, reply_id)
            }
            Err(LlmError::Cancelled { partial }) => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    chars = partial.len(),
                    "reply cancelled"
                );
                store.finalize_truncated(conversation_id, reply_id)
            }
            Err(e) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "chat request failed"
                );
                store.fail_turn(conversation_id, reply_id, e.to_string())
            }
        };
        if let Err(e) = closed {
            tracing::warn!(message_id = %reply_id, error = %e, "could not close reply");
        }

        let reply = store
            .conversation(conversation_id)
            .and_then(|c| c.messages.iter().rfind(|m| &m.id == reply_id))
            .cloned()
            .ok_or_else(|| ConversationError::NotFound(conversation_id.clone()))?;

        let reply = if reply.status == MessageStatus::Complete {
            let cleaned = postprocess(kind, model_id, &reply.content);
            if cleaned != reply.content {
                store.rewrite_content(conversation_id, reply_id, cleaned.clone())?;
            }
            Message {
                content: cleaned,
                ..reply
            }
        } else {
            reply
        };

        if let Err(e) = store.persist(conversation_id) {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %e,
                "failed to save conversation"
            );
        }
        Ok(reply)
    }

    /// Prior messages as sent to the provider. Failed and empty replies are
    /// left out; documents attached to earlier turns are inlined again.
    fn request_history(&self, messages: Vec<Message>) -> Vec<ChatMessage> {
        messages
            .into_iter()
            .filter(|m| !matches!(m.status, MessageStatus::Failed { .. }))
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| {
                let mut content = m.content;
                if let (Role::User, Some(id)) = (m.role, &m.document) {
                    match self.attachments.get_attachment(id) {
                        Ok(Some(document)) => {
                            content.push_str("\n\n");
                            content.push_str(&document_text(&document).render());
                        }
                        Ok(None) => {
                            tracing::warn!(attachment_id = %id, "attachment missing from history");
                        }
                        Err(e) => {
                            tracing::warn!(
                                attachment_id = %id,
                                error = %e,
                                "failed to load attachment"
                            );
                        }
                    }
                }
                ChatMessage {
                    role: m.role,
                    content,
                }
            })
            .collect()
    }
}

fn document_text(document: &Attachment) -> DocumentText {
    DocumentText {
        filename: document.filename.clone(),
        text: document
            .text
            .clone()
            .unwrap_or_else(|| String::from_utf8_lossy(&document.bytes).into_owned()),
    }
}

fn user_turn(
    prompt: &str,
    image: Option<&Attachment>,
    document: Option<&Attachment>,
) -> UserTurn {
    let mut turn = UserTurn::text(prompt.trim());
    if let Some(image) = image {
        turn = turn.with_image(InlineImage::from_bytes(image.mime_type.clone(), &image.bytes));
    }
    if let Some(document) = document {
        turn = turn.with_document(document_text(document));
    }
    turn
}

fn stored_content(
    prompt: &str,
    image: Option<&Attachment>,
    document: Option<&Attachment>,
) -> String {
    let prompt = prompt.trim();
    match (image, document) {
        _ if !prompt.is_empty() => prompt.to_string(),
        (_, Some(document)) => document.filename.clone(),
        (Some(_), None) => IMAGE_ONLY_CONTENT.to_string(),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::storage::{ConversationStorage, MemoryStorage};
    use crate::db::models::{AttachmentId, AttachmentKind};
    use crate::transport::testing::{ScriptedResponse, ScriptedTransport};
    use crate::transport::{HttpRequest, HttpResponse};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    fn openai_chunk(text: &str) -> String {
        let chunk = serde_json::json!({
            "choices": [{ "delta": { "content": text }, "finish_reason": null }]
        });
        format!("data: {chunk}\n\n")
    }

    fn all_keys() -> HashMap<ProviderKind, String> {
        ProviderKind::ALL
            .into_iter()
            .map(|kind| (kind, format!("{}-key", kind.prefix())))
            .collect()
    }

    fn service_with(
        settings: Settings,
        transport: &ScriptedTransport,
        keys: HashMap<ProviderKind, String>,
    ) -> (ChatService, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let service = ChatService::new(
            settings,
            ConversationStore::with_storage(storage.clone()),
            storage.clone(),
            Arc::new(transport.clone()),
            Arc::new(keys),
        );
        (service, storage)
    }

    fn service(transport: &ScriptedTransport) -> (ChatService, Arc<MemoryStorage>) {
        service_with(Settings::default(), transport, all_keys())
    }

    /// Holds every request until the gate is opened.
    struct GatedTransport {
        gate: Arc<Notify>,
        inner: ScriptedTransport,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LlmError> {
            self.gate.notified().await;
            self.inner.send(request).await
        }
    }

    #[test]
    fn test_resolve_provider_prefixes() {
        let settings = Settings::default();
        let keys = all_keys();

        let (provider, model) =
            resolve_provider("claude/claude-sonnet-4-20250514", &settings, &keys);
        assert_eq!(provider.kind(), ProviderKind::Claude);
        assert_eq!(model, "claude-sonnet-4-20250514");

        let (provider, model) =
            resolve_provider("openrouter/deepseek/deepseek-r1-zero:free", &settings, &keys);
        assert_eq!(provider.kind(), ProviderKind::OpenRouter);
        assert_eq!(model, "deepseek/deepseek-r1-zero:free");

        let (provider, model) = resolve_provider("gpt-4o", &settings, &keys);
        assert_eq!(provider.kind(), ProviderKind::OpenAi);
        assert_eq!(model, "gpt-4o");
    }

    #[test]
    fn test_resolve_provider_uses_configured_endpoint() {
        let mut settings = Settings::default();
        settings.providers.openai.base_url = Some("http://localhost:8080/v1".into());
        settings.providers.claude.max_tokens = 256;

        let (provider, _) = resolve_provider("openai/o3-mini", &settings, &all_keys());
        let Provider::OpenAi(config) = provider else {
            panic!("expected openai");
        };
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.api_key.as_deref(), Some("openai-key"));

        let no_keys = HashMap::<ProviderKind, String>::new();
        let (provider, _) = resolve_provider("claude/c", &settings, &no_keys);
        let Provider::Claude(config) = provider else {
            panic!("expected claude");
        };
        assert_eq!(config.max_tokens, 256);
        assert_eq!(config.api_key, None);
    }

    #[tokio::test]
    async fn test_streamed_turn_is_recorded_and_persisted() {
        let transport = ScriptedTransport::new(vec![ScriptedResponse::ok(&[
            &openai_chunk("Hello"),
            &openai_chunk(", world"),
            "data: [DONE]\n\n",
        ])]);
        let (service, storage) = service(&transport);

        let mut seen = Vec::new();
        let outcome = service
            .send_message(Submission::new("Say hello"), CancellationToken::new(), |d| {
                seen.push(d.clone())
            })
            .await
            .unwrap();

        assert_eq!(outcome.reply.content, "Hello, world");
        assert_eq!(outcome.reply.status, MessageStatus::Complete);
        assert_eq!(outcome.reply.model.as_deref(), Some("openai/o3-mini"));
        assert!(seen.last().unwrap().is_final);

        let saved = storage.load(&outcome.conversation_id).unwrap().unwrap();
        assert_eq!(saved.title, "Say hello");
        assert_eq!(saved.messages.len(), 2);
        assert_eq!(saved.messages[0].id, outcome.user_message_id);

        let sent = transport.sent();
        assert_eq!(sent[0].url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(sent[0].body["model"], "o3-mini");
        assert_eq!(sent[0].body["stream"], true);
    }

    #[tokio::test]
    async fn test_follow_up_sends_bounded_history_without_failed_turns() {
        let transport = ScriptedTransport::new(vec![
            ScriptedResponse::ok(&[&openai_chunk("a1"), "data: [DONE]\n\n"]),
            ScriptedResponse::status(500, r#"{"error":{"message":"overloaded"}}"#),
            ScriptedResponse::ok(&[&openai_chunk("a3"), "data: [DONE]\n\n"]),
        ]);
        let mut settings = Settings::default();
        settings.max_history = 3;
        let (service, _) = service_with(settings, &transport, all_keys());

        let first = service
            .send_message(Submission::new("q1"), CancellationToken::new(), |_| {})
            .await
            .unwrap();
        let id = first.conversation_id;

        let mut second = Submission::new("q2");
        second.conversation_id = Some(id.clone());
        let failed = service
            .send_message(second, CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(
            failed.reply.status,
            MessageStatus::Failed {
                error: "API error: 500 - overloaded".into()
            }
        );

        let mut third = Submission::new("q3");
        third.conversation_id = Some(id.clone());
        service
            .send_message(third, CancellationToken::new(), |_| {})
            .await
            .unwrap();

        // Window of 3 is [a1, q2, failed]; the failed reply is not sent.
        let sent = transport.sent();
        let contents: Vec<&str> = sent[2].body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["a1", "q2", "q3"]);

        let conversation = service.get_conversation(&id).unwrap().unwrap();
        assert_eq!(conversation.messages.len(), 6);
    }

    #[tokio::test]
    async fn test_truncated_stream_keeps_partial_reply() {
        let transport = ScriptedTransport::new(vec![ScriptedResponse::ok(&[&openai_chunk(
            "Once upon",
        )])]);
        let (service, _) = service(&transport);

        let outcome = service
            .send_message(Submission::new("Tell a story"), CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.reply.content, "Once upon");
        assert_eq!(outcome.reply.status, MessageStatus::Truncated);
    }

    #[tokio::test]
    async fn test_cancelled_turn_is_closed_and_next_turn_allowed() {
        // Cancelled before sending, so only the second turn reaches the transport.
        let transport = ScriptedTransport::new(vec![ScriptedResponse::ok(&[
            &openai_chunk("ok"),
            "data: [DONE]\n\n",
        ])]);
        let (service, _) = service(&transport);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = service
            .send_message(Submission::new("hi"), cancel, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.reply.status, MessageStatus::Truncated);
        assert!(transport.sent().is_empty());

        let mut next = Submission::new("again");
        next.conversation_id = Some(outcome.conversation_id);
        let outcome = service
            .send_message(next, CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.reply.content, "ok");
    }

    #[tokio::test]
    async fn test_missing_credential_fails_turn_without_request() {
        let transport = ScriptedTransport::new(Vec::new());
        let (service, _) = service_with(Settings::default(), &transport, HashMap::new());

        let mut submission = Submission::new("hello");
        submission.model = Some("gemini/gemini-2.0-flash".into());
        let outcome = service
            .send_message(submission, CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert!(matches!(
            &outcome.reply.status,
            MessageStatus::Failed { error } if error.contains("GEMINI_API_KEY")
        ));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_turn_rejected_before_recording() {
        let scripted = ScriptedTransport::new(vec![ScriptedResponse::ok(&[
            &openai_chunk("a1"),
            "data: [DONE]\n\n",
        ])]);
        let gate = Arc::new(Notify::new());
        let storage = Arc::new(MemoryStorage::new());
        let service = ChatService::new(
            Settings::default(),
            ConversationStore::with_storage(storage.clone()),
            storage,
            Arc::new(GatedTransport {
                gate: gate.clone(),
                inner: scripted.clone(),
            }),
            Arc::new(all_keys()),
        );
        let id = ConversationId::new();
        let mut first = Submission::new("q1");
        first.conversation_id = Some(id.clone());
        let mut second = Submission::new("q2");
        second.conversation_id = Some(id.clone());

        let (first, second) = tokio::join!(
            service.send_message(first, CancellationToken::new(), |_| {}),
            async {
                let result = service
                    .send_message(second, CancellationToken::new(), |_| {})
                    .await;
                gate.notify_one();
                result
            }
        );

        assert!(matches!(
            second,
            Err(ChatError::Conversation(ConversationError::TurnInProgress { .. }))
        ));
        let first = first.unwrap();
        assert_eq!(first.reply.content, "a1");
        assert_eq!(first.reply.status, MessageStatus::Complete);

        let conversation = service.get_conversation(&id).unwrap().unwrap();
        let contents: Vec<&str> = conversation
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["q1", "a1"]);
        assert_eq!(scripted.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_mid_stream_provider_error_fails_reply() {
        let delta = serde_json::json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": "Par" }
        });
        let error = serde_json::json!({
            "type": "error",
            "error": { "type": "overloaded_error", "message": "Overloaded" }
        });
        let transport = ScriptedTransport::new(vec![ScriptedResponse::ok(&[
            &format!("event: content_block_delta\ndata: {delta}\n\n"),
            &format!("event: error\ndata: {error}\n\n"),
        ])]);
        let (service, storage) = service(&transport);

        let mut submission = Submission::new("Write a poem");
        submission.model = Some("claude/claude-sonnet-4-20250514".into());
        let outcome = service
            .send_message(submission, CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(outcome.reply.content, "Par");
        assert_eq!(
            outcome.reply.status,
            MessageStatus::Failed {
                error: "API error: Overloaded".into()
            }
        );
        let saved = storage.load(&outcome.conversation_id).unwrap().unwrap();
        assert_eq!(saved.messages[1].status, outcome.reply.status);
    }

    #[tokio::test]
    async fn test_empty_submission_is_rejected_before_recording() {
        let transport = ScriptedTransport::new(Vec::new());
        let (service, _) = service(&transport);

        let err = service
            .send_message(Submission::new("   "), CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Llm(LlmError::EmptyPrompt)));
        assert!(service.list_conversations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_streaming_deepseek_answer_is_cleaned() {
        let transport = ScriptedTransport::new(vec![ScriptedResponse::ok(&[
            r#"{"choices":[{"message":{"role":"assistant","content":"\\boxed{4}"}}]}"#,
        ])]);
        let (service, _) = service(&transport);

        let mut submission = Submission::new("2+2?");
        submission.model = Some("openrouter/deepseek/deepseek-r1-zero:free".into());
        submission.stream = false;
        let outcome = service
            .send_message(submission, CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(outcome.reply.content, "4");
        let stored = service
            .get_conversation(&outcome.conversation_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages[1].content, "4");
        assert_eq!(
            transport.sent()[0].url,
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_document_only_turn_and_follow_up_context() {
        let transport = ScriptedTransport::new(vec![
            ScriptedResponse::ok(&[&openai_chunk("Noted"), "data: [DONE]\n\n"]),
            ScriptedResponse::ok(&[&openai_chunk("Yes"), "data: [DONE]\n\n"]),
        ]);
        let (service, storage) = service(&transport);
        let document = Attachment {
            id: AttachmentId::new(),
            kind: AttachmentKind::Document,
            mime_type: "text/plain".into(),
            filename: "notes.txt".into(),
            bytes: b"alpha".to_vec(),
            text: Some("alpha".into()),
        };

        let mut submission = Submission::new("");
        submission.document = Some(document.clone());
        let outcome = service
            .send_message(submission, CancellationToken::new(), |_| {})
            .await
            .unwrap();
        let conversation = service
            .get_conversation(&outcome.conversation_id)
            .unwrap()
            .unwrap();
        assert_eq!(conversation.messages[0].content, "notes.txt");
        assert_eq!(conversation.messages[0].document.as_ref(), Some(&document.id));
        assert!(storage.get_attachment(&document.id).unwrap().is_some());

        let mut follow_up = Submission::new("Does it mention alpha?");
        follow_up.conversation_id = Some(outcome.conversation_id);
        service
            .send_message(follow_up, CancellationToken::new(), |_| {})
            .await
            .unwrap();
        let first_turn = transport.sent()[1].body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(
            first_turn,
            "notes.txt\n\n<document name=\"notes.txt\">\nalpha\n</document>"
        );
    }

    #[test]
    fn test_stored_content_for_attachment_only_turns() {
        let image = Attachment {
            id: AttachmentId::new(),
            kind: AttachmentKind::Image,
            mime_type: "image/png".into(),
            filename: "cat.png".into(),
            bytes: vec![1, 2, 3],
            text: None,
        };
        assert_eq!(stored_content("", Some(&image), None), IMAGE_ONLY_CONTENT);
        assert_eq!(
            stored_content(" what is this ", Some(&image), None),
            "what is this"
        );
    }
}
