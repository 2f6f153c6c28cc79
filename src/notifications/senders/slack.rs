use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;

use super::{ensure_success, NotificationSender, SenderError};
use crate::notifications::models::ChannelConfig;

/// Posts alert messages to a Slack incoming webhook.
pub struct SlackSender {
    client: Client,
}

impl Default for SlackSender {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl SlackSender {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Slack mrkdwn treats `&`, `<` and `>` as control characters.
    fn escape_mrkdwn(text: &str) -> String {
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    }
}

#[derive(Serialize)]
struct SlackMessage<'a> {
    text: &'a str,
}

#[async_trait]
impl NotificationSender for SlackSender {
    async fn send(
        &self,
        config: &ChannelConfig,
        message: &str,
        _context: &HashMap<String, String>,
    ) -> Result<(), SenderError> {
        let ChannelConfig::Slack { webhook_url } = config else {
            return Err(SenderError::InvalidConfiguration(
                "Expected Slack config, but found a different type.".to_string(),
            ));
        };

        let escaped = Self::escape_mrkdwn(message);
        let response = self
            .client
            .post(webhook_url)
            .json(&SlackMessage { text: &escaped })
            .send()
            .await?;
        ensure_success("Slack", response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_characters() {
        assert_eq!(
            SlackSender::escape_mrkdwn("<https://x> & up"),
            "&lt;https://x&gt; &amp; up"
        );
    }
}
