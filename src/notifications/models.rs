use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::db::models::{Alert, InvocationEvent, Monitor};

/// Delivery configuration for one alert channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelConfig {
    Email {
        to: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Slack {
        webhook_url: String,
    },
    #[serde(rename_all = "camelCase")]
    DiscordWebhook {
        webhook_url: String,
    },
    #[serde(rename_all = "camelCase")]
    Webhook {
        url: String,
        method: String, // "GET" or "POST"
        headers: Option<HashMap<String, String>>,
        body_template: Option<String>, // Tera template for POST bodies
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelType {
    Email,
    Slack,
    DiscordWebhook,
    Webhook,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelType::Email => "email",
            ChannelType::Slack => "slack",
            ChannelType::DiscordWebhook => "discordWebhook",
            ChannelType::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

fn check_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid channel url '{raw}': {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported channel url scheme '{other}'")),
    }
}

impl ChannelConfig {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            ChannelConfig::Email { .. } => ChannelType::Email,
            ChannelConfig::Slack { .. } => ChannelType::Slack,
            ChannelConfig::DiscordWebhook { .. } => ChannelType::DiscordWebhook,
            ChannelConfig::Webhook { .. } => ChannelType::Webhook,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ChannelConfig::Email { to } => {
                if to.is_empty() {
                    return Err("email channel needs at least one recipient".to_string());
                }
                if let Some(bad) = to.iter().find(|addr| !addr.contains('@')) {
                    return Err(format!("invalid email recipient '{bad}'"));
                }
                Ok(())
            }
            ChannelConfig::Slack { webhook_url } | ChannelConfig::DiscordWebhook { webhook_url } => {
                check_url(webhook_url)
            }
            ChannelConfig::Webhook { url, method, .. } => {
                check_url(url)?;
                match method.to_uppercase().as_str() {
                    "GET" | "POST" => Ok(()),
                    other => Err(format!("unsupported webhook method '{other}'")),
                }
            }
        }
    }
}

/// One alert lifecycle event, as handed to the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub event: InvocationEvent,
    pub timestamp: DateTime<Utc>,
    pub alert: Alert,
    pub monitor: Monitor,
    /// Message of the probe result that triggered the transition.
    pub detail: Option<String>,
}

impl AlertEvent {
    /// Template variables shared by message rendering and webhook bodies.
    pub fn context(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        ctx.insert("event".to_string(), self.event.as_str().to_string());
        ctx.insert("timestamp".to_string(), self.timestamp.to_rfc3339());
        ctx.insert("alert_id".to_string(), self.alert.alert_id.clone());
        ctx.insert("alert_name".to_string(), self.alert.name.clone());
        ctx.insert("severity".to_string(), self.alert.severity.to_string());
        ctx.insert("monitor_id".to_string(), self.monitor.monitor_id.clone());
        ctx.insert("monitor_name".to_string(), self.monitor.name.clone());
        ctx.insert("url".to_string(), self.monitor.url.clone());
        ctx.insert(
            "failure_threshold".to_string(),
            self.monitor.failure_threshold.to_string(),
        );
        if let Some(detail) = &self.detail {
            ctx.insert("detail".to_string(), detail.clone());
        }
        ctx
    }
}

/// Outcome of delivering one event to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDelivery {
    pub channel_type: ChannelType,
    pub delivered: bool,
    pub error: Option<String>,
}
