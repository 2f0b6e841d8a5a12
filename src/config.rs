use crate::stream::Strictness;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_model() -> String {
    "openai/o3-mini".to_string()
}

fn default_max_history() -> usize {
    10
}

fn default_claude_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Messages of prior history sent with each request.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Where the SQLite database lives; platform data dir when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub providers: ProviderSettings,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct StreamSettings {
    /// Overrides how undecodable stream payloads are handled.
    #[serde(default)]
    pub strictness: Option<Strictness>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ProviderSettings {
    #[serde(default)]
    pub openai: EndpointSettings,
    #[serde(default)]
    pub openrouter: EndpointSettings,
    #[serde(default)]
    pub claude: ClaudeSettings,
    #[serde(default)]
    pub gemini: EndpointSettings,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct EndpointSettings {
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClaudeSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_claude_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ClaudeSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            max_tokens: default_claude_max_tokens(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            default_model: default_model(),
            max_history: default_max_history(),
            system_prompt: None,
            data_dir: None,
            stream: StreamSettings::default(),
            providers: ProviderSettings::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Error reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Error parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Settings {
    /// Loads settings from `path`, or from the default location when `None`.
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Settings::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let settings = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn default_config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("polychat"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("polychat"))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}
