use crate::conversation::storage::StorageError;
use crate::db::Database;
use crate::llm::ProviderKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
}

/// Where API keys come from.
pub trait CredentialSource: Send + Sync {
    fn api_key(&self, kind: ProviderKind) -> Option<String>;
}

/// Reads `OPENAI_API_KEY`, `OPENROUTER_API_KEY`, `ANTHROPIC_API_KEY` and
/// `GEMINI_API_KEY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn api_key(&self, kind: ProviderKind) -> Option<String> {
        std::env::var(kind.api_key_env())
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

impl CredentialSource for Database {
    fn api_key(&self, kind: ProviderKind) -> Option<String> {
        match self.get_setting(&setting_key(kind)) {
            Ok(value) => value.filter(|key| !key.trim().is_empty()),
            Err(e) => {
                tracing::error!(provider = %kind, error = %e, "failed to read stored API key");
                None
            }
        }
    }
}

impl CredentialSource for HashMap<ProviderKind, String> {
    fn api_key(&self, kind: ProviderKind) -> Option<String> {
        self.get(&kind).cloned()
    }
}

impl<T: CredentialSource + ?Sized> CredentialSource for std::sync::Arc<T> {
    fn api_key(&self, kind: ProviderKind) -> Option<String> {
        (**self).api_key(kind)
    }
}

/// Tries each source in order; the first key found wins.
pub struct ChainedCredentials {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl ChainedCredentials {
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self { sources }
    }
}

impl CredentialSource for ChainedCredentials {
    fn api_key(&self, kind: ProviderKind) -> Option<String> {
        self.sources.iter().find_map(|source| source.api_key(kind))
    }
}

/// Settings-table key holding the API key for `kind`.
pub fn setting_key(kind: ProviderKind) -> String {
    format!("{}_api_key", kind.prefix())
}

fn is_known_key(key: &str) -> bool {
    ProviderKind::ALL.iter().any(|kind| setting_key(*kind) == key)
}

/// Stored API keys, masked for display.
pub fn get_settings(db: &Database) -> Result<HashMap<String, String>, StorageError> {
    let mut map = HashMap::new();
    for kind in ProviderKind::ALL {
        let key = setting_key(kind);
        if let Some(value) = db.get_setting(&key)? {
            map.insert(key, mask(&value));
        }
    }
    Ok(map)
}

fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "*".repeat(chars.len())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingError {
    #[error("Unknown setting key: {0}")]
    UnknownKey(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), SettingError> {
    if !is_known_key(key) {
        return Err(SettingError::UnknownKey(key.to_string()));
    }
    db.set_setting(key, value.trim())?;
    Ok(())
}

pub fn delete_setting(db: &Database, key: &str) -> Result<(), SettingError> {
    if !is_known_key(key) {
        return Err(SettingError::UnknownKey(key.to_string()));
    }
    db.delete_setting(key)?;
    Ok(())
}

fn catalogue(kind: ProviderKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        ProviderKind::OpenAi => &[("o3-mini", "OpenAI o3-mini"), ("gpt-4o", "GPT-4o")],
        ProviderKind::OpenRouter => &[("deepseek/deepseek-r1-zero:free", "DeepSeek R1 Zero")],
        ProviderKind::Claude => &[
            ("claude-sonnet-4-20250514", "Claude Sonnet 4"),
            ("claude-3-5-haiku-20241022", "Claude Haiku 3.5"),
        ],
        ProviderKind::Gemini => &[("gemini-2.0-flash", "Gemini 2.0 Flash")],
    }
}

/// Models whose provider has a credential configured.
pub fn get_available_models(credentials: &dyn CredentialSource) -> Vec<ModelInfo> {
    ProviderKind::ALL
        .into_iter()
        .filter(|kind| credentials.api_key(*kind).is_some())
        .flat_map(|kind| {
            catalogue(kind).iter().map(move |(id, name)| ModelInfo {
                id: format!("{}/{}", kind.prefix(), id),
                name: name.to_string(),
                provider: kind.display_name().to_string(),
            })
        })
        .collect()
}
