use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{NotificationSender, SenderError};
use crate::notifications::models::ChannelConfig;

/// Outbound SMTP relay used for email channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

pub struct EmailSender {
    settings: Option<SmtpSettings>,
}

impl EmailSender {
    /// Without settings every send fails with `InvalidConfiguration`.
    pub fn new(settings: Option<SmtpSettings>) -> Self {
        Self { settings }
    }

    fn build_message(
        settings: &SmtpSettings,
        to: &[String],
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<Message, SenderError> {
        let from: Mailbox = settings.from.parse().map_err(|e| {
            SenderError::InvalidConfiguration(format!("Invalid sender address: {e}"))
        })?;

        let subject = match (context.get("event"), context.get("monitor_name")) {
            (Some(event), Some(monitor)) => format!("[{event}] {monitor}"),
            _ => "Monitor alert".to_string(),
        };

        let mut builder = Message::builder().from(from).subject(subject);
        for recipient in to {
            let mailbox: Mailbox = recipient.parse().map_err(|e| {
                SenderError::InvalidConfiguration(format!("Invalid recipient '{recipient}': {e}"))
            })?;
            builder = builder.to(mailbox);
        }

        builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.to_string())
            .map_err(|e| SenderError::SendFailed(format!("Failed to build email: {e}")))
    }
}

#[async_trait]
impl NotificationSender for EmailSender {
    async fn send(
        &self,
        config: &ChannelConfig,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<(), SenderError> {
        let ChannelConfig::Email { to } = config else {
            return Err(SenderError::InvalidConfiguration(
                "Expected Email config, but found a different type.".to_string(),
            ));
        };
        let settings = self.settings.as_ref().ok_or_else(|| {
            SenderError::InvalidConfiguration("SMTP is not configured".to_string())
        })?;

        let email = Self::build_message(settings, to, message, context)?;

        let mut transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            .map_err(|e| SenderError::InvalidConfiguration(format!("Invalid SMTP host: {e}")))?
            .port(settings.port);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            transport = transport.credentials(Credentials::new(username.clone(), password.clone()));
        }

        transport
            .build()
            .send(email)
            .await
            .map_err(|e| SenderError::SendFailed(format!("SMTP delivery failed: {e}")))?;
        Ok(())
    }
}
