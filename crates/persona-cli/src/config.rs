//! Configuration Vault – reads/writes `~/.persona/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use persona_memory::{DEFAULT_CAPACITY, DEFAULT_RECALL_WINDOW, TriggerTable};
use persona_runtime::FailurePolicy;
use persona_runtime::llm_driver::DEFAULT_BASE_URL;
use persona_runtime::summarizer::{MAX_SUMMARY_TURNS, MAX_TURN_CHARS};
use persona_types::ChatError;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An API key, wiped from memory on drop.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// The key, or `None` when unset.
    pub fn expose(&self) -> Option<&str> {
        if self.is_empty() { None } else { Some(self.0.trim()) }
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_empty() { "<not set>" } else { "<redacted>" })
    }
}

/// Where conversation history is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Sqlite,
    /// Process-local; history is lost on exit.
    Memory,
}

/// Persisted user configuration stored in `~/.persona/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the OpenAI-compatible inference API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Candidate models, highest priority first.
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    /// Candidate models for summaries; empty means the same as `models`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summary_models: Vec<String>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Bound on a single model attempt (and on each streamed chunk).
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Emit the reply as server-sent events instead of one JSON object.
    #[serde(default)]
    pub stream: bool,

    #[serde(default)]
    pub storage: StorageKind,

    /// SQLite file; defaults to `~/.persona/history.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,

    /// Turns kept per conversation.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Newest turns scanned by similarity recall.
    #[serde(default = "default_recall_window")]
    pub recall_window: usize,

    /// Most turns recalled per request.
    #[serde(default = "default_relevant_limit")]
    pub relevant_limit: usize,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    #[serde(default = "default_summary_max_turns")]
    pub summary_max_turns: usize,

    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    /// Key for reply models (stored as plain text; the file is written
    /// owner-only).
    #[serde(default, skip_serializing_if = "Secret::is_empty")]
    pub chat_api_key: Secret,

    /// Key for summary models.
    #[serde(default, skip_serializing_if = "Secret::is_empty")]
    pub summary_api_key: Secret,

    /// Recall trigger phrases.
    #[serde(default)]
    pub triggers: TriggerTable,
}

fn default_api_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_models() -> Vec<String> {
    [
        "gemma2-9b-it",
        "llama3-70b-8192",
        "llama3-8b-8192",
        "llama-3.1-8b-instant",
        "qwen/qwen3-32b",
        "moonshotai/kimi-k2-instruct",
        "llama-3.3-70b-versatile",
        "meta-llama/llama-4-scout-17b-16e-instruct",
        "openai/gpt-oss-20b",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}
fn default_attempt_timeout_secs() -> u64 {
    30
}
fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_recall_window() -> usize {
    DEFAULT_RECALL_WINDOW
}
fn default_relevant_limit() -> usize {
    3
}
fn default_similarity_threshold() -> f64 {
    0.3
}
fn default_summary_max_turns() -> usize {
    MAX_SUMMARY_TURNS
}
fn default_summary_max_chars() -> usize {
    MAX_TURN_CHARS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            models: default_models(),
            summary_models: Vec::new(),
            failure_policy: FailurePolicy::default(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            stream: false,
            storage: StorageKind::default(),
            db_path: None,
            capacity: default_capacity(),
            recall_window: default_recall_window(),
            relevant_limit: default_relevant_limit(),
            similarity_threshold: default_similarity_threshold(),
            summary_max_turns: default_summary_max_turns(),
            summary_max_chars: default_summary_max_chars(),
            chat_api_key: Secret::default(),
            summary_api_key: Secret::default(),
            triggers: TriggerTable::default(),
        }
    }
}

impl Config {
    /// Models used for summaries.
    pub fn summary_models(&self) -> Vec<String> {
        if self.summary_models.is_empty() {
            self.models.clone()
        } else {
            self.summary_models.clone()
        }
    }

    /// The SQLite file, resolved against `home` when not configured.
    pub fn db_path_for_home(&self, home: &str) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(home).join(".persona").join("history.db"))
    }

    /// Reject settings no request could be served with.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.models.iter().all(|m| m.trim().is_empty()) {
            return Err(ChatError::Config("models must name at least one model".into()));
        }
        if self.capacity == 0 {
            return Err(ChatError::Config("capacity must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ChatError::Config(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// The user's home directory (`HOME`, then `USERPROFILE`, then `.`).
pub fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// Return the path to `~/.persona/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".persona").join("config.toml")
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, ChatError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| ChatError::Config(format!("Failed to read config at {}: {}", path.display(), e)))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| ChatError::Config(format!("Failed to parse config: {}", e)))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load `path`, falling back to defaults (plus environment overrides) when
/// the file is absent.
pub fn load_or_default(path: &Path) -> Result<Config, ChatError> {
    match load_from(path)? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

/// Apply `PERSONA_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `PERSONA_API_BASE_URL` | `api_base_url` |
/// | `PERSONA_MODELS` | `models` (comma-separated) |
/// | `PERSONA_FAILURE_POLICY` | `failure_policy` (`permissive` / `strict`) |
/// | `PERSONA_STORAGE` | `storage` (`sqlite` / `memory`) |
/// | `PERSONA_DB_PATH` | `db_path` |
/// | `PERSONA_CAPACITY` | `capacity` |
/// | `PERSONA_STREAM` | `stream` (`true` / `false`) |
/// | `PERSONA_CHAT_API_KEY` | `chat_api_key` |
/// | `PERSONA_SUMMARY_API_KEY` | `summary_api_key` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("PERSONA_API_BASE_URL") {
        cfg.api_base_url = v;
    }
    if let Ok(v) = std::env::var("PERSONA_MODELS") {
        let models: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        if !models.is_empty() {
            cfg.models = models;
        }
    }
    if let Ok(v) = std::env::var("PERSONA_FAILURE_POLICY") {
        match v.trim().to_lowercase().as_str() {
            "permissive" => cfg.failure_policy = FailurePolicy::Permissive,
            "strict" => cfg.failure_policy = FailurePolicy::Strict,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("PERSONA_STORAGE") {
        match v.trim().to_lowercase().as_str() {
            "sqlite" => cfg.storage = StorageKind::Sqlite,
            "memory" => cfg.storage = StorageKind::Memory,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("PERSONA_DB_PATH")
        && !v.trim().is_empty()
    {
        cfg.db_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("PERSONA_CAPACITY")
        && let Ok(capacity) = v.trim().parse::<usize>()
    {
        cfg.capacity = capacity;
    }
    if let Ok(v) = std::env::var("PERSONA_STREAM")
        && let Ok(stream) = v.trim().parse::<bool>()
    {
        cfg.stream = stream;
    }
    if let Ok(v) = std::env::var("PERSONA_CHAT_API_KEY") {
        cfg.chat_api_key = Secret::new(v);
    }
    if let Ok(v) = std::env::var("PERSONA_SUMMARY_API_KEY") {
        cfg.summary_api_key = Secret::new(v);
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ChatError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ChatError::Config(format!("Failed to create config directory: {}", e)))?;
        // Owner-only directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                ChatError::Config(format!("Failed to set config directory permissions: {}", e))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| ChatError::Config(format!("Failed to serialize config: {}", e)))?;
    // Owner-only file (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| ChatError::Config(format!("Failed to write config at {}: {}", path.display(), e)))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| ChatError::Config(format!("Failed to write config at {}: {}", path.display(), e)))?;
    Ok(())
}
