use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;

use super::{ensure_success, NotificationSender, SenderError};
use crate::notifications::models::ChannelConfig;

/// Discord rejects message content above this many characters.
const MAX_CONTENT_CHARS: usize = 2000;

pub struct DiscordSender {
    client: Client,
}

impl Default for DiscordSender {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl DiscordSender {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn truncate(message: &str) -> String {
        if message.chars().count() <= MAX_CONTENT_CHARS {
            return message.to_string();
        }
        let mut truncated: String = message.chars().take(MAX_CONTENT_CHARS - 1).collect();
        truncated.push('…');
        truncated
    }
}

#[derive(Serialize)]
struct DiscordMessage<'a> {
    content: &'a str,
}

#[async_trait]
impl NotificationSender for DiscordSender {
    async fn send(
        &self,
        config: &ChannelConfig,
        message: &str,
        _context: &HashMap<String, String>,
    ) -> Result<(), SenderError> {
        let ChannelConfig::DiscordWebhook { webhook_url } = config else {
            return Err(SenderError::InvalidConfiguration(
                "Expected Discord webhook config, but found a different type.".to_string(),
            ));
        };

        let content = Self::truncate(message);
        let response = self
            .client
            .post(webhook_url)
            .json(&DiscordMessage { content: &content })
            .send()
            .await?;
        ensure_success("Discord", response).await
    }
}
