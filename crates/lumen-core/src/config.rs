use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CompletionOptions, GenerationConfig, LumenError, ModelCatalog, Result};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";
pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LumenConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "ModelCatalog::builtin")]
    pub catalog: ModelCatalog,
}

impl Default for LumenConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            chat: ChatConfig::default(),
            storage: StorageConfig::default(),
            catalog: ModelCatalog::builtin(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Ollama,
    Placeholder,
}

impl std::str::FromStr for EngineKind {
    type Err = LumenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(EngineKind::Ollama),
            "placeholder" | "echo" => Ok(EngineKind::Placeholder),
            other => Err(LumenError::Config(format!("unknown engine: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub host: String,
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            host: DEFAULT_OLLAMA_HOST.to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub system_prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    pub include_usage: bool,
    /// Max wait for the next streamed fragment. `None` or 0 disables the limit.
    pub stream_read_timeout_secs: Option<u64>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.7,
            top_p: 0.95,
            max_tokens: None,
            include_usage: true,
            stream_read_timeout_secs: Some(120),
        }
    }
}

impl ChatConfig {
    pub fn generation(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
        }
    }

    pub fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            include_usage: self.include_usage,
        }
    }

    pub fn stream_read_timeout(&self) -> Option<Duration> {
        self.stream_read_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(default_db_path)
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lumen")
        .join("lumen.db")
}

impl LumenConfig {
    /// Read a JSON config file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Defaults, then the optional file, then environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `LUMEN_*` (and `OLLAMA_HOST`) overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup("LUMEN_ENGINE") {
            self.engine.kind = kind.parse()?;
        }

        if let Some(host) = lookup("LUMEN_HOST").or_else(|| lookup("OLLAMA_HOST")) {
            self.engine.host = normalize_host(&host);
        }

        if let Some(prompt) = lookup("LUMEN_SYSTEM_PROMPT") {
            self.chat.system_prompt = prompt;
        }

        if let Some(path) = lookup("LUMEN_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(path));
        }

        if let Some(secs) = lookup("LUMEN_STREAM_TIMEOUT_SECS") {
            let secs = secs
                .trim()
                .parse::<u64>()
                .map_err(|e| LumenError::Config(format!("LUMEN_STREAM_TIMEOUT_SECS: {}", e)))?;
            self.chat.stream_read_timeout_secs = Some(secs);
        }

        Ok(())
    }
}

/// `OLLAMA_HOST` is often given as `host:port`; make it a URL.
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        return host.to_string();
    }
    format!("http://{}", host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = LumenConfig::default();
        assert_eq!(config.engine.host, DEFAULT_OLLAMA_HOST);
        assert_eq!(config.chat.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.chat.stream_read_timeout(), Some(Duration::from_secs(120)));
        assert!(config.chat.completion_options().include_usage);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumen.json");
        std::fs::write(
            &path,
            r#"{"chat": {"system_prompt": "Be brief.", "include_usage": false}}"#,
        )
        .unwrap();

        let config = LumenConfig::load(&path).unwrap();
        assert_eq!(config.chat.system_prompt, "Be brief.");
        assert!(!config.chat.include_usage);
        assert_eq!(config.chat.temperature, 0.7);
        assert_eq!(config.chat.stream_read_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.engine.kind, EngineKind::Ollama);
        assert!(!config.catalog.is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LUMEN_ENGINE", "placeholder"),
            ("OLLAMA_HOST", "127.0.0.1:9999"),
            ("LUMEN_STREAM_TIMEOUT_SECS", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = LumenConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.engine.kind, EngineKind::Placeholder);
        assert_eq!(config.engine.host, "http://127.0.0.1:9999");
        assert_eq!(config.chat.stream_read_timeout(), None);
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = LumenConfig::default();
        let result = config.apply_env(|k| (k == "LUMEN_ENGINE").then(|| "gpt".to_string()));
        assert!(matches!(result, Err(LumenError::Config(_))));
    }
}
