//! CLI argument definitions for the Noor terminal client.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

use noor_core::config::{default_config_path, NoorConfig};
use noor_core::types::SourceFilter;

/// Noor: ask questions, get answers citing the Quran and Hadith.
#[derive(Parser, Debug)]
#[command(name = "noor", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Base URL of the answer service API.
    #[arg(short = 'u', long = "base-url")]
    pub base_url: Option<String>,

    /// Bearer token for the answer service.
    #[arg(short = 't', long = "token")]
    pub token: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Initial source filter (both, quran, hadith).
    #[arg(short = 'f', long = "filter")]
    pub filter: Option<SourceFilter>,

    /// Fail a request on malformed stream lines instead of skipping them.
    #[arg(long = "strict")]
    pub strict: bool,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > NOOR_CONFIG env var > ~/.noor/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("NOOR_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the bearer token.
    ///
    /// Priority: --token flag > NOOR_TOKEN env var > config file value.
    pub fn resolve_token(&self, config_token: Option<String>) -> Option<String> {
        if let Some(ref t) = self.token {
            return Some(t.clone());
        }
        if let Ok(t) = std::env::var("NOOR_TOKEN") {
            if !t.is_empty() {
                return Some(t);
            }
        }
        config_token
    }

    /// Apply every override to a loaded configuration.
    pub fn apply(&self, config: &mut NoorConfig) {
        if let Some(ref url) = self.base_url {
            config.api.base_url = url.clone();
        }
        config.api.token = self.resolve_token(config.api.token.take());
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(filter) = self.filter {
            config.chat.default_filter = filter;
        }
        if self.strict {
            config.chat.strict_decoding = true;
        }
    }
}
