use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use super::models::ChannelConfig;

pub mod discord;
pub mod email;
pub mod slack;
pub mod webhook;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Templating error: {0}")]
    TemplatingError(String),
}

/// A trait for sending notifications to a specific channel type.
/// All concrete sender implementations (e.g., Slack, Webhook) must implement this trait.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Sends a notification.
    ///
    /// # Arguments
    ///
    /// * `config` - The channel configuration this sender handles.
    /// * `message` - The rendered alert message.
    /// * `context` - Template variables for channels that render their own body.
    async fn send(
        &self,
        config: &ChannelConfig,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<(), SenderError>;
}

/// Fails with `SendFailed` carrying the response body on non-2xx statuses.
pub(crate) async fn ensure_success(
    provider: &str,
    response: reqwest::Response,
) -> Result<(), SenderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let error_body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    Err(SenderError::SendFailed(format!(
        "{provider} returned non-success status: {status}. Body: {error_body}"
    )))
}
