//! SMTP sending via async lettre (STARTTLS relay + credentials).

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};

use mailwave_core::config::SmtpConfig;

use crate::{EmailTransport, SendError, SendErrorKind, SendReply};

/// Live SMTP transport. A fresh relay connection per send — each delivery is
/// a single bounded operation with no state carried between calls.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn from_mailbox(&self) -> Result<Mailbox, SendError> {
        format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| {
                SendError::new(
                    SendErrorKind::InvalidRecipient,
                    format!("invalid from address: {e}"),
                )
            })
    }
}

#[async_trait]
impl EmailTransport for SmtpMailer {
    async fn send(
        &self,
        to: &str,
        to_name: Option<&str>,
        subject: &str,
        body: &str,
    ) -> Result<SendReply, SendError> {
        let to_mailbox: Mailbox = match to_name {
            Some(name) => format!("{name} <{to}>"),
            None => to.to_string(),
        }
        .parse()
        .map_err(|e| {
            SendError::new(
                SendErrorKind::InvalidRecipient,
                format!("invalid recipient address: {e}"),
            )
        })?;

        let email = Message::builder()
            .from(self.from_mailbox()?)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| SendError::new(SendErrorKind::Rejected, format!("build email: {e}")))?;

        let creds = Credentials::new(self.config.username.clone(), self.config.password.clone());

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
            .map_err(|e| SendError::new(SendErrorKind::Connection, format!("SMTP relay: {e}")))?
            .port(self.config.port)
            .credentials(creds)
            .build();

        let response = mailer.send(email).await.map_err(|e| {
            let kind = if e.is_permanent() {
                SendErrorKind::Rejected
            } else if e.is_client() {
                SendErrorKind::Auth
            } else {
                SendErrorKind::Connection
            };
            SendError::new(kind, format!("SMTP send: {e}"))
        })?;

        tracing::info!("📤 Email sent to {to}");
        Ok(SendReply {
            smtp_response: Some(format!("{} {}", response.code(), response.message().collect::<Vec<_>>().join(" "))),
        })
    }
}
