/// Configuration module for notesrag.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── Default value functions ──────────────────────────────────────────

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_search_top_k() -> usize {
    5
}

fn default_history_turns() -> usize {
    6
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_timeout() -> u64 {
    30
}

fn default_soap_sections() -> bool {
    true
}

fn default_llm_provider() -> String {
    "ollama".to_string()
}

fn default_scripted_response() -> String {
    "No language model is configured. The passages retrieved for this question are listed as sources.".to_string()
}

fn default_llm_model() -> String {
    "mistral".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_max_upload_mb() -> usize {
    50
}

/// Embedding providers understood by [`Config::validate`].
pub const EMBEDDING_PROVIDERS: &[&str] = &["hashing", "ollama"];

/// Language-model providers understood by [`Config::validate`].
pub const LLM_PROVIDERS: &[&str] = &["ollama", "scripted"];

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root for `app.db` and the per-client directories.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Chunk SOAP-style notes section by section.
    #[serde(default = "default_soap_sections")]
    pub soap_sections: bool,

    #[serde(default = "default_search_top_k")]
    pub search_top_k: usize,

    /// Number of most recent chat messages included in the prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    /// `hashing` (local, deterministic) or `ollama`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    /// `ollama`, or `scripted` to answer with `scripted_response` offline.
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    /// Idle timeout between streamed fragments.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_scripted_response")]
    pub scripted_response: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            soap_sections: default_soap_sections(),
            search_top_k: default_search_top_k(),
            history_turns: default_history_turns(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            base_url: default_ollama_url(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            base_url: default_ollama_url(),
            timeout_secs: default_llm_timeout(),
            scripted_response: default_scripted_response(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`.
    /// If the file does not exist, returns a default config and optionally
    /// generates a template file.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "config.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            // Generate template only for the default path
            if path == "config.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(
            self.chunk_overlap < self.chunk_size,
            "chunk_overlap ({}) must be smaller than chunk_size ({})",
            self.chunk_overlap,
            self.chunk_size
        );
        anyhow::ensure!(self.search_top_k > 0, "search_top_k must be positive");
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be positive"
        );
        anyhow::ensure!(
            EMBEDDING_PROVIDERS.contains(&self.embedding.provider.as_str()),
            "unknown embedding.provider '{}' (expected one of {:?})",
            self.embedding.provider,
            EMBEDDING_PROVIDERS
        );
        anyhow::ensure!(
            LLM_PROVIDERS.contains(&self.llm.provider.as_str()),
            "unknown llm.provider '{}' (expected one of {:?})",
            self.llm.provider,
            LLM_PROVIDERS
        );
        anyhow::ensure!(!self.llm.model.is_empty(), "llm.model must not be empty");
        anyhow::ensure!(
            self.server.max_upload_mb > 0,
            "server.max_upload_mb must be positive"
        );
        Ok(())
    }

    /// Path of the process-wide catalog database.
    #[must_use]
    pub fn app_db_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("app.db")
    }

    #[must_use]
    pub fn clients_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("clients")
    }
}

// ── Tests ────────────────────────────────────────────────────────────
