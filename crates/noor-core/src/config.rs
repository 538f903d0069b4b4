use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{NoorError, Result};
use crate::types::SourceFilter;

/// Top-level configuration for the Noor client.
///
/// Loaded from `~/.noor/config.toml` by default. Each section corresponds
/// to one concern of the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoorConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl NoorConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NoorConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("No configuration at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| NoorError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the session file.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.noor/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl GeneralConfig {
    /// The data directory with a leading `~` expanded to the home directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }
}

/// Answer service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL every path below is appended to.
    pub base_url: String,
    /// Streaming question endpoint.
    pub ask_stream_path: String,
    /// Past turns endpoint.
    pub history_path: String,
    /// Connection timeout in seconds. Body reads are not time-limited.
    pub connect_timeout_secs: u64,
    /// Bearer credential sent with every request, if any.
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            ask_stream_path: "/ask/stream/".to_string(),
            history_path: "/history/".to_string(),
            connect_timeout_secs: 10,
            token: None,
        }
    }
}

impl ApiConfig {
    /// Full URL of the streaming question endpoint.
    pub fn ask_stream_url(&self) -> String {
        join_url(&self.base_url, &self.ask_stream_path)
    }

    /// Full URL of the history endpoint.
    pub fn history_url(&self) -> String {
        join_url(&self.base_url, &self.history_path)
    }
}

/// Conversation engine behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Number of cited passages requested per answer.
    pub source_limit: u32,
    /// Corpus filter used when the caller does not pick one.
    pub default_filter: SourceFilter,
    /// Longest accepted question, in characters.
    pub max_question_chars: usize,
    /// Conversation titles are cut to this many characters.
    pub title_max_chars: usize,
    /// Surface unparseable stream lines as errors instead of skipping them.
    pub strict_decoding: bool,
    /// In-stream `error_code` values that mean the quota is exhausted.
    pub limit_error_codes: Vec<String>,
    /// Stream lines longer than this are dropped as malformed.
    pub max_line_bytes: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            source_limit: 5,
            default_filter: SourceFilter::Both,
            max_question_chars: 2000,
            title_max_chars: 40,
            strict_decoding: false,
            limit_error_codes: vec![
                "limit_reached".to_string(),
                "limit".to_string(),
                "rate_limited".to_string(),
                "quota_exceeded".to_string(),
            ],
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// Locally cached usage, used until a server profile is available.
///
/// Without a configured allowance the client refuses nothing and leaves
/// enforcement to the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Daily request allowance; `<= 0` means unlimited.
    pub daily_limit: i64,
    /// Requests already consumed on `last_request_date`.
    pub used_today: i64,
    /// Day `used_today` was counted on; `None` means today.
    pub last_request_date: Option<NaiveDate>,
}

/// Default config file path for the current platform.
pub fn default_config_path() -> PathBuf {
    match home_dir() {
        Some(home) => home.join(".noor").join("config.toml"),
        None => PathBuf::from("config.toml"),
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";
    std::env::var(var).ok().map(PathBuf::from)
}

/// Expand `~` to the home directory in a path string.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        let home = home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
