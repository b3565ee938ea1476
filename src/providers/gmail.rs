use async_trait::async_trait;

use super::{EmailMessage, Provider, ProviderConfig, ProviderError, SmtpProvider};

pub const GMAIL_SMTP_HOST: &str = "smtp.gmail.com";
pub const GMAIL_SMTP_PORT: u16 = 587;

/// Gmail accounts relay through the fixed Google submission endpoint with an
/// app password; everything else is the plain SMTP path.
pub struct GmailProvider {
    inner: SmtpProvider,
}

impl GmailProvider {
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        config.host = Some(GMAIL_SMTP_HOST.to_string());
        config.port = Some(GMAIL_SMTP_PORT);
        config.use_tls = false;
        config.use_starttls = true;

        Ok(Self {
            inner: SmtpProvider::new(config)?,
        })
    }
}

#[async_trait]
impl Provider for GmailProvider {
    async fn send(&self, message: &EmailMessage) -> Result<(), ProviderError> {
        self.inner.send(message).await
    }

    async fn verify(&self) -> Result<bool, ProviderError> {
        self.inner.verify().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preset_overrides_configured_host() {
        let config = ProviderConfig {
            host: Some("smtp.attacker.example".into()),
            port: Some(2525),
            username: "someone@gmail.com".into(),
            password: "app-password".into(),
            from_address: "someone@gmail.com".into(),
            from_name: None,
            use_tls: true,
            use_starttls: false,
        };

        // Construction succeeds against the pinned Google endpoint.
        assert!(GmailProvider::new(config).is_ok());
    }
}
