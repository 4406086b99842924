//! Runtime configuration
//!
//! Every option is a command-line flag with an environment fallback.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Minimum content length (chars) before a story gets an embedding
pub const DEFAULT_EMBEDDING_MIN_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Provider {
    Gemini,
    Openai,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::Openai => "openai",
        }
    }

    fn key_env(&self) -> &'static str {
        match self {
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Openai => "OPENAI_API_KEY",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "quantum-storytelling")]
#[command(about = "Tensor-conditioned creative writing service", long_about = None)]
pub struct Config {
    /// Address to serve the HTTP API on
    #[arg(long, env = "QS_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// SQLite database file
    #[arg(long, env = "QS_DATABASE", default_value = "quantum-storytelling.db")]
    pub database: PathBuf,

    /// Directory for daily log files (console only when unset)
    #[arg(long, env = "QS_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// LLM provider backing generation and embeddings
    #[arg(long, env = "QS_PROVIDER", value_enum, default_value = "gemini")]
    pub provider: Provider,

    /// Provider API key; falls back to GEMINI_API_KEY or OPENAI_API_KEY
    #[arg(long, env = "QS_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Text generation model (provider default when unset)
    #[arg(long, env = "QS_MODEL")]
    pub model: Option<String>,

    /// Embedding model (provider default when unset)
    #[arg(long, env = "QS_EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    /// Override the provider base URL
    #[arg(long, env = "QS_API_BASE")]
    pub api_base: Option<String>,

    /// Stories longer than this get an embedding
    #[arg(long, env = "QS_EMBEDDING_MIN_CHARS", default_value_t = DEFAULT_EMBEDDING_MIN_CHARS)]
    pub embedding_min_chars: usize,
}

impl Config {
    /// Resolve the API key for the selected provider.
    pub fn resolve_api_key(&self) -> Result<String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::resolve_api_key`], reading the environment through `lookup`.
    pub fn resolve_api_key_with<F>(&self, lookup: F) -> Result<String>
    where
        F: FnOnce(&str) -> Option<String>,
    {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| lookup(self.provider.key_env()))
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no API key for provider '{}': pass --api-key or set {}",
                    self.provider.as_str(),
                    self.provider.key_env()
                ))
            })
    }
}
