//! Configuration for the promptpool CLI.
//!
//! Run settings come from a plain `key=value` file; paths and switches come
//! from CLI arguments with environment fallbacks.

use crate::error::{PoolError, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

/// Default API endpoint when the config file names none.
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/";

/// CLI arguments for the promptpool client.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "promptpool",
    version,
    about = "Concurrent, rate-limit-aware batch client for chat-completion APIs",
    after_help = "EXAMPLES:\n    \
        promptpool\n    \
        promptpool --config prod.conf --inputs ./texts\n    \
        promptpool --json-logs --no-progress"
)]
pub struct Args {
    /// Path to the key=value configuration file
    #[arg(short, long, default_value = "config", env = "PROMPTPOOL_CONFIG")]
    pub config: PathBuf,

    /// Directory containing one .txt file per input text
    #[arg(short, long, default_value = "inputs", env = "PROMPTPOOL_INPUTS")]
    pub inputs: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, env = "PROMPTPOOL_VERBOSE")]
    pub verbose: bool,

    /// Output logs as JSON
    #[arg(long, env = "PROMPTPOOL_JSON_LOGS")]
    pub json_logs: bool,

    /// Disable the progress bar
    #[arg(long, env = "PROMPTPOOL_NO_PROGRESS")]
    pub no_progress: bool,
}

impl Args {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Run settings loaded from the `key=value` config file.
///
/// Recognised keys: `endpoint`, `key`, `org`, `proj`, `model`, `prompt`,
/// `max`, `workers`, `ratio`. Lines starting with `#` are comments; a line
/// without `=` is a key with an empty value.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Base URL of the API, always ending in `/`.
    pub endpoint: String,
    /// API key.
    pub key: String,
    /// Organization ID, sent as `OpenAI-Organization` when non-empty.
    pub org: String,
    /// Project ID, sent as `OpenAI-Project` when non-empty.
    pub proj: String,
    /// Model to select.
    pub model: String,
    /// System prompt; empty disables the system message.
    pub prompt: String,
    /// Completion-token cap; zero disables the cap.
    pub max_tokens: u64,
    /// Worker cap; zero means hardware concurrency.
    pub workers: usize,
    /// Characters-to-tokens ratio override.
    pub tokens_per_character: Option<f32>,
}

impl Settings {
    /// Load settings from a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PoolError::ConfigFileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content)
    }

    /// Parse settings from `key=value` lines.
    pub fn parse(content: &str) -> Result<Self> {
        let mut settings = Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            ..Self::default()
        };

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (line, ""),
            };

            match key {
                "endpoint" if !value.is_empty() => {
                    settings.endpoint = if value.ends_with('/') {
                        value.to_string()
                    } else {
                        format!("{value}/")
                    };
                }
                "endpoint" => {}
                "key" => settings.key = value.to_string(),
                "org" => settings.org = value.to_string(),
                "proj" => settings.proj = value.to_string(),
                "model" => settings.model = value.to_string(),
                "prompt" => settings.prompt = value.to_string(),
                "max" if !value.is_empty() => {
                    settings.max_tokens = value.parse().map_err(|_| {
                        PoolError::InvalidConfig(format!("invalid value for 'max': '{value}'"))
                    })?;
                }
                "max" => {}
                "workers" if !value.is_empty() => {
                    settings.workers = value.parse().map_err(|_| {
                        PoolError::InvalidConfig(format!("invalid value for 'workers': '{value}'"))
                    })?;
                }
                "workers" => {}
                "ratio" if !value.is_empty() => {
                    let ratio: f32 = value.parse().map_err(|_| {
                        PoolError::InvalidConfig(format!("invalid value for 'ratio': '{value}'"))
                    })?;
                    if ratio <= 0.0 {
                        return Err(PoolError::InvalidConfig(
                            "'ratio' must be positive".to_string(),
                        ));
                    }
                    settings.tokens_per_character = Some(ratio);
                }
                "ratio" => {}
                _ => {} // unknown keys are ignored
            }
        }

        Ok(settings)
    }

    /// Validate that the settings are usable for a run.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(PoolError::InvalidConfig(
                "'key' is missing from the config file".to_string(),
            ));
        }
        if self.model.is_empty() {
            return Err(PoolError::InvalidConfig(
                "'model' is missing from the config file".to_string(),
            ));
        }

        Ok(())
    }

    /// Assemble the extra header lines for `org` and `proj`.
    pub fn extra_headers(&self) -> Vec<String> {
        let mut headers = Vec::new();
        add_header_if_not_empty(&mut headers, "OpenAI-Organization", &self.org);
        add_header_if_not_empty(&mut headers, "OpenAI-Project", &self.proj);
        headers
    }
}

fn add_header_if_not_empty(to: &mut Vec<String>, name: &str, value: &str) {
    if value.is_empty() {
        return;
    }

    to.push(format!("{name}: {value}"));
}
