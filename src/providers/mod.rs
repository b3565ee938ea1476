pub mod gmail;
pub mod smtp;

pub use gmail::*;
pub use smtp::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::accounts::ProviderKind;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("email error: {0}")]
    Email(#[from] lettre::error::Error),
    #[error("address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("invalid attachment content type: {0}")]
    ContentType(String),
    #[error("invalid provider config: {0}")]
    InvalidConfig(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Decrypted per-account transport settings. Only ever materialized for the
/// account actually chosen for a send; the `Debug` impl hides credentials.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub from_address: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub use_starttls: bool,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("from_address", &self.from_address)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAttachment {
    pub filename: String,
    pub content: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub to: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
}

/// A live outbound transport for one physical sender account. Owned by a
/// single send; `close` is idempotent and must run on every exit path.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), ProviderError>;
    async fn verify(&self) -> Result<bool, ProviderError>;
    async fn close(&self);
}

/// The only place the provider variants are named.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        kind: ProviderKind,
        config: ProviderConfig,
    ) -> Result<Box<dyn Provider>, ProviderError>;
}

/// Maps `gmail` to the Gmail SMTP preset and `smtp` to the configured relay.
pub struct LettreProviderFactory;

impl ProviderFactory for LettreProviderFactory {
    fn create(
        &self,
        kind: ProviderKind,
        config: ProviderConfig,
    ) -> Result<Box<dyn Provider>, ProviderError> {
        match kind {
            ProviderKind::Gmail => Ok(Box::new(GmailProvider::new(config)?)),
            ProviderKind::Smtp => Ok(Box::new(SmtpProvider::new(config)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_config_debug_redacts_password() {
        let config = ProviderConfig {
            host: Some("smtp.example.com".into()),
            port: Some(587),
            username: "user".into(),
            password: "hunter2".into(),
            from_address: "user@example.com".into(),
            from_name: None,
            use_tls: false,
            use_starttls: true,
        };

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
    }
}
