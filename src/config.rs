use base64::{engine::general_purpose::STANDARD as BASE64_ENGINE, Engine};
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

const ENV_DB_PATH: &str = "MAILBLAST_DB_PATH";
const ENV_BASE_URL: &str = "MAILBLAST_BASE_URL";
const ENV_BASE_URL_LEGACY: &str = "TRUSTED_BASE_URL";
const ENV_MASTER_KEY: &str = "MAILBLAST_MASTER_KEY";
const ENV_PACE_MS: &str = "MAILBLAST_PACE_MS";

const DEFAULT_DB_PATH: &str = "mailblast.db";
const DEFAULT_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_PACE_MS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidVar(&'static str, String),
}

/// Engine-wide configuration. The master key decrypts per-account provider
/// configs; it never appears in logs or `Debug` output.
pub struct EngineConfig {
    pub database_path: PathBuf,
    /// Trusted origin for tracking pixel and click URLs.
    pub base_url: String,
    pub master_key: Zeroizing<Vec<u8>>,
    /// Delay between recipients within one campaign.
    pub pace: Duration,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("database_path", &self.database_path)
            .field("base_url", &self.base_url)
            .field("master_key", &"<redacted>")
            .field("pace", &self.pace)
            .finish()
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = std::env::var(ENV_DB_PATH)
            .unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
            .into();

        let base_url = std::env::var(ENV_BASE_URL)
            .or_else(|_| std::env::var(ENV_BASE_URL_LEGACY))
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let encoded =
            std::env::var(ENV_MASTER_KEY).map_err(|_| ConfigError::MissingVar(ENV_MASTER_KEY))?;
        let master_key = Zeroizing::new(
            BASE64_ENGINE
                .decode(encoded.as_bytes())
                .map_err(|e| ConfigError::InvalidVar(ENV_MASTER_KEY, e.to_string()))?,
        );

        let pace = match std::env::var(ENV_PACE_MS) {
            Ok(raw) => Duration::from_millis(
                raw.parse::<u64>()
                    .map_err(|e| ConfigError::InvalidVar(ENV_PACE_MS, e.to_string()))?,
            ),
            Err(_) => Duration::from_millis(DEFAULT_PACE_MS),
        };

        Ok(Self {
            database_path,
            base_url,
            master_key,
            pace,
        })
    }

    /// Configuration for a given database path and raw key bytes, used by
    /// embedders and tests that do not read the environment.
    pub fn new(database_path: impl Into<PathBuf>, base_url: impl Into<String>, key: &[u8]) -> Self {
        Self {
            database_path: database_path.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            master_key: Zeroizing::new(key.to_vec()),
            pace: Duration::from_millis(DEFAULT_PACE_MS),
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let cfg = EngineConfig::new("x.db", "https://mail.example.com/", b"0123456789abcdef");
        assert_eq!(cfg.base_url, "https://mail.example.com");
    }

    #[test]
    fn debug_redacts_master_key() {
        let cfg = EngineConfig::new("x.db", "https://mail.example.com", b"super-secret-key");
        let rendered = format!("{:?}", cfg);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("super-secret-key"));
    }
}
