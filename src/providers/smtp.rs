use async_trait::async_trait;
use lettre::message::{header, Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{EmailMessage, Provider, ProviderConfig, ProviderError};

/// Generic SMTP relay provider backed by lettre's pooled async transport.
pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| ProviderError::InvalidConfig("missing smtp host".into()))?;

        let credentials = Credentials::new(config.username.clone(), config.password.clone());

        let mut builder = if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)?
        } else if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host)
        };

        builder = builder.credentials(credentials);
        if let Some(port) = config.port {
            builder = builder.port(port);
        }

        let from = match &config.from_name {
            Some(name) => format!("{} <{}>", name, config.from_address),
            None => config.from_address.clone(),
        };

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Provider for SmtpProvider {
    async fn send(&self, message: &EmailMessage) -> Result<(), ProviderError> {
        let email = build_message(&self.from, message)?;
        self.transport.send(email).await?;
        Ok(())
    }

    async fn verify(&self) -> Result<bool, ProviderError> {
        Ok(self.transport.test_connection().await?)
    }

    async fn close(&self) {
        // lettre's pooled connections are closed on drop.
    }
}

pub(crate) fn build_message(from: &str, email: &EmailMessage) -> Result<Message, ProviderError> {
    let mut builder = Message::builder()
        .from(from.parse()?)
        .to(email.to.parse()?)
        .subject(email.subject.clone());

    for cc in &email.cc {
        builder = builder.cc(cc.parse()?);
    }
    for bcc in &email.bcc {
        builder = builder.bcc(bcc.parse()?);
    }

    let html_part = SinglePart::builder()
        .header(header::ContentType::TEXT_HTML)
        .body(email.html.clone());

    let message = if email.attachments.is_empty() {
        builder.singlepart(html_part)?
    } else {
        let mut multipart = MultiPart::mixed().singlepart(html_part);
        for attachment in &email.attachments {
            let content_type = header::ContentType::parse(&attachment.mime_type)
                .map_err(|e| ProviderError::ContentType(e.to_string()))?;
            multipart = multipart.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), content_type),
            );
        }
        builder.multipart(multipart)?
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> EmailMessage {
        EmailMessage {
            to: "rcpt@example.com".into(),
            cc: vec!["cc@example.com".into()],
            bcc: vec![],
            subject: "Hello".into(),
            html: "<p>Hi</p>".into(),
            attachments: vec![],
        }
    }

    #[test]
    fn builds_plain_html_message() {
        let built = build_message("Sender <sender@example.com>", &message());
        assert!(built.is_ok());
    }

    #[test]
    fn rejects_malformed_recipient() {
        let mut bad = message();
        bad.to = "not an address".into();
        assert!(matches!(
            build_message("sender@example.com", &bad),
            Err(ProviderError::Address(_))
        ));
    }

    #[test]
    fn builds_message_with_attachment() {
        let mut with_attachment = message();
        with_attachment.attachments.push(super::super::EmailAttachment {
            filename: "report.txt".into(),
            content: b"totals".to_vec(),
            mime_type: "text/plain".into(),
        });

        assert!(build_message("sender@example.com", &with_attachment).is_ok());
    }

    #[test]
    fn missing_host_is_rejected() {
        let config = ProviderConfig {
            host: None,
            port: None,
            username: "u".into(),
            password: "p".into(),
            from_address: "u@example.com".into(),
            from_name: None,
            use_tls: false,
            use_starttls: false,
        };

        assert!(matches!(
            SmtpProvider::new(config),
            Err(ProviderError::InvalidConfig(_))
        ));
    }
}
