//! Client configuration.
//!
//! Loaded from `~/.mcp-voice/settings.json` (comments allowed) or an explicit
//! path. Every field has a default, so a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mcp_protocol::AudioConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Backoff policy for retried calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    /// Upper bound for a single delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            backoff_factor: 1.5,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1`:
    /// `min(initial × factor^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }

    /// Apply a partial update; absent fields keep their value.
    pub fn apply(&mut self, update: &RetryConfigUpdate) {
        if let Some(v) = update.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = update.initial_delay_ms {
            self.initial_delay_ms = v;
        }
        if let Some(v) = update.backoff_factor {
            self.backoff_factor = v;
        }
        if let Some(v) = update.max_delay_ms {
            self.max_delay_ms = v;
        }
    }
}

/// Partial [`RetryConfig`] used for runtime overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfigUpdate {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// MCP server endpoint
    pub server_url: String,
    pub retry: RetryConfig,
    /// Fixed delay before reconnecting after the link drops
    pub reconnect_delay_ms: u64,
    /// Audio parameters announced when a transcription session starts
    pub audio: AudioConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".into(),
            retry: RetryConfig::default(),
            reconnect_delay_ms: 5000,
            audio: AudioConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl ClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// `~/.mcp-voice/settings.json`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".mcp-voice").join("settings.json"))
    }

    /// Parse a settings document. `//` and `/* */` comments are allowed.
    pub fn from_jsonc(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(&strip_jsonc_comments(content))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_jsonc(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Load from `path` if given (it must exist), otherwise from the default
    /// location if present, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No settings file, using defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Strip C-style comments from JSONC content.
fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(ch) = chars.next() {
        if in_string {
            result.push(ch);
            if ch == '\\' {
                if let Some(next) = chars.next() {
                    result.push(next);
                }
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        let next = chars.peek().copied();
        match (ch, next) {
            ('"', _) => {
                in_string = true;
                result.push(ch);
            }
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => result.push(ch),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 300,
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(300));
        assert_eq!(config.delay_for(10), Duration::from_millis(300));
    }

    #[test]
    fn default_backoff_matches_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_millis(500));
        assert_eq!(config.delay_for(1), Duration::from_millis(750));
        assert_eq!(config.delay_for(2), Duration::from_millis(1125));
    }

    #[test]
    fn partial_update_keeps_other_fields() {
        let mut config = RetryConfig::default();
        config.apply(&RetryConfigUpdate {
            max_retries: Some(1),
            ..Default::default()
        });
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.initial_delay_ms, 500);
        assert_eq!(config.max_delay_ms, 5000);
    }

    #[test]
    fn jsonc_settings_with_partial_fields() {
        let config = ClientConfig::from_jsonc(
            r#"{
                // local dev server
                "serverUrl": "ws://127.0.0.1:9000/mcp", /* trailing */
                "retry": { "maxRetries": 5 },
                "note": "urls like http://x stay intact"
            }"#,
        )
        .unwrap();
        assert_eq!(config.server_url, "ws://127.0.0.1:9000/mcp");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_factor, 1.5);
        assert_eq!(config.reconnect_delay_ms, 5000);
        assert_eq!(config.audio.sample_rate, 16_000);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"reconnectDelayMs": 250}"#).unwrap();

        let config = ClientConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClientConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
