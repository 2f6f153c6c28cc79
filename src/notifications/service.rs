use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tera::{Context, Tera};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::models::{AlertEvent, ChannelConfig, ChannelDelivery, ChannelType};
use super::senders::{
    discord::DiscordSender,
    email::{EmailSender, SmtpSettings},
    slack::SlackSender,
    webhook::WebhookSender,
    NotificationSender, SenderError,
};
use crate::db::models::InvocationEvent;

/// Shared client for every HTTP-based sender.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
});

const INCIDENT_START_TEMPLATE: &str = "\
[{{ severity | upper }}] {{ monitor_name }} is DOWN
Alert: {{ alert_name }}
URL: {{ url }}
Failed {{ failure_threshold }} consecutive check(s) as of {{ timestamp }}\
{% if detail is defined %}
Detail: {{ detail }}{% endif %}";

const INCIDENT_END_TEMPLATE: &str = "\
[RESOLVED] {{ monitor_name }} is back UP
Alert: {{ alert_name }}
URL: {{ url }}
Recovered at {{ timestamp }}";

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Sender error: {0}")]
    Sender(#[from] SenderError),
    #[error("Unsupported channel type: {0}")]
    UnsupportedChannel(ChannelType),
    #[error("Rendering error: {0}")]
    Rendering(String),
}

/// Delivers alert lifecycle events. Implementations are best-effort: a
/// failed channel is reported in the result, never raised.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> Vec<ChannelDelivery>;
}

pub struct NotificationService {
    senders: HashMap<ChannelType, Box<dyn NotificationSender>>,
    monitor_webhook: WebhookSender,
}

impl NotificationService {
    pub fn new(smtp: Option<SmtpSettings>) -> Self {
        let mut senders: HashMap<ChannelType, Box<dyn NotificationSender>> = HashMap::new();
        senders.insert(ChannelType::Email, Box::new(EmailSender::new(smtp)));
        senders.insert(
            ChannelType::Slack,
            Box::new(SlackSender::new(HTTP_CLIENT.clone())),
        );
        senders.insert(
            ChannelType::DiscordWebhook,
            Box::new(DiscordSender::new(HTTP_CLIENT.clone())),
        );
        senders.insert(
            ChannelType::Webhook,
            Box::new(WebhookSender::new(HTTP_CLIENT.clone())),
        );
        Self {
            senders,
            monitor_webhook: WebhookSender::new(HTTP_CLIENT.clone()),
        }
    }

    /// Replaces the sender used for one channel type.
    pub fn with_sender(mut self, channel_type: ChannelType, sender: Box<dyn NotificationSender>) -> Self {
        self.senders.insert(channel_type, sender);
        self
    }

    pub fn render_message(event: &AlertEvent) -> Result<String, NotificationError> {
        let template = match event.event {
            InvocationEvent::IncidentStart => INCIDENT_START_TEMPLATE,
            InvocationEvent::IncidentEnd => INCIDENT_END_TEMPLATE,
        };
        let context = Context::from_serialize(event.context())
            .map_err(|e| NotificationError::Rendering(e.to_string()))?;
        Tera::one_off(template, &context, false).map_err(|e| NotificationError::Rendering(e.to_string()))
    }

    async fn deliver(
        &self,
        channel: &ChannelConfig,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<(), NotificationError> {
        let channel_type = channel.channel_type();
        let sender = self
            .senders
            .get(&channel_type)
            .ok_or(NotificationError::UnsupportedChannel(channel_type))?;
        sender.send(channel, message, context).await?;
        Ok(())
    }

    async fn post_monitor_webhook(&self, url: &str, message: &str, context: &HashMap<String, String>) {
        let config = ChannelConfig::Webhook {
            url: url.to_string(),
            method: "POST".to_string(),
            headers: None,
            body_template: None,
        };
        if let Err(e) = self.monitor_webhook.send(&config, message, context).await {
            warn!(url, error = %e, "Monitor webhook delivery failed.");
        }
    }
}

#[async_trait]
impl AlertNotifier for NotificationService {
    async fn notify(&self, event: &AlertEvent) -> Vec<ChannelDelivery> {
        let context = event.context();
        let message = match Self::render_message(event) {
            Ok(message) => message,
            Err(e) => {
                warn!(alert_id = %event.alert.alert_id, error = %e, "Falling back to plain alert message.");
                format!(
                    "{} {} ({})",
                    event.event, event.monitor.name, event.monitor.url
                )
            }
        };

        let mut seen: Vec<&ChannelConfig> = Vec::new();
        let mut deliveries = Vec::with_capacity(event.alert.channels.len());
        for channel in &event.alert.channels {
            if seen.contains(&channel) {
                debug!(alert_id = %event.alert.alert_id, channel = %channel.channel_type(), "Skipping duplicate channel.");
                continue;
            }
            seen.push(channel);

            let result = self.deliver(channel, &message, &context).await;
            let delivery = ChannelDelivery {
                channel_type: channel.channel_type(),
                delivered: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            };
            match &result {
                Ok(()) => info!(
                    alert_id = %event.alert.alert_id,
                    monitor_id = %event.monitor.monitor_id,
                    channel = %delivery.channel_type,
                    event = %event.event,
                    "Notification delivered."
                ),
                Err(e) => warn!(
                    alert_id = %event.alert.alert_id,
                    monitor_id = %event.monitor.monitor_id,
                    channel = %delivery.channel_type,
                    error = %e,
                    "Notification delivery failed."
                ),
            }
            deliveries.push(delivery);
        }

        if let Some(url) = &event.monitor.webhook_url {
            self.post_monitor_webhook(url, &message, &context).await;
        }

        deliveries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Alert, CheckFrequency, HttpRequestParams, Monitor, Severity};
    use chrono::{TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder {
        messages: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSender for Recorder {
        async fn send(
            &self,
            _config: &ChannelConfig,
            message: &str,
            _context: &HashMap<String, String>,
        ) -> Result<(), SenderError> {
            self.messages.lock().unwrap().push(message.to_string());
            if self.fail {
                Err(SenderError::SendFailed("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn event(kind: InvocationEvent, channels: Vec<ChannelConfig>) -> AlertEvent {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 0).unwrap();
        AlertEvent {
            event: kind,
            timestamp: at,
            alert: Alert {
                owner_id: "owner".to_string(),
                alert_id: "a1".to_string(),
                name: "on-call".to_string(),
                severity: Severity::Critical,
                channels,
                enabled: true,
            },
            monitor: Monitor {
                owner_id: "owner".to_string(),
                monitor_id: "m1".to_string(),
                name: "api".to_string(),
                url: "https://api.example.com".to_string(),
                regions: vec!["us-east-1".to_string()],
                frequency: CheckFrequency::FiveMinutes,
                failure_threshold: 2,
                request: HttpRequestParams::default(),
                up_conditions: Vec::new(),
                alert_ids: vec!["a1".to_string()],
                webhook_url: None,
                created_at: at,
                last_updated: at,
            },
            detail: Some("connection refused".to_string()),
        }
    }

    fn slack(url: &str) -> ChannelConfig {
        ChannelConfig::Slack {
            webhook_url: url.to_string(),
        }
    }

    #[test]
    fn renders_both_event_kinds() {
        let start = NotificationService::render_message(&event(InvocationEvent::IncidentStart, Vec::new())).unwrap();
        assert!(start.starts_with("[CRITICAL] api is DOWN"));
        assert!(start.contains("Failed 2 consecutive"));
        assert!(start.contains("Detail: connection refused"));

        let mut end_event = event(InvocationEvent::IncidentEnd, Vec::new());
        end_event.detail = None;
        let end = NotificationService::render_message(&end_event).unwrap();
        assert!(end.starts_with("[RESOLVED] api is back UP"));
    }

    #[tokio::test]
    async fn failed_channel_does_not_block_the_others() {
        let ok = Recorder::default();
        let failing = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let service = NotificationService::new(None)
            .with_sender(ChannelType::Slack, Box::new(ok.clone()))
            .with_sender(ChannelType::DiscordWebhook, Box::new(failing.clone()));

        let deliveries = service
            .notify(&event(
                InvocationEvent::IncidentStart,
                vec![
                    ChannelConfig::DiscordWebhook {
                        webhook_url: "https://discord.com/api/webhooks/1/x".to_string(),
                    },
                    slack("https://hooks.slack.com/services/T/B/X"),
                ],
            ))
            .await;

        assert_eq!(deliveries.len(), 2);
        assert!(!deliveries[0].delivered);
        assert!(deliveries[0].error.is_some());
        assert!(deliveries[1].delivered);
        assert_eq!(ok.messages.lock().unwrap().len(), 1);
        assert_eq!(failing.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn identical_channels_are_notified_once() {
        let recorder = Recorder::default();
        let service = NotificationService::new(None).with_sender(ChannelType::Slack, Box::new(recorder.clone()));
        let channel = slack("https://hooks.slack.com/services/T/B/X");

        let deliveries = service
            .notify(&event(
                InvocationEvent::IncidentStart,
                vec![channel.clone(), channel, slack("https://hooks.slack.com/services/T/B/Y")],
            ))
            .await;

        assert_eq!(deliveries.len(), 2);
        assert_eq!(recorder.messages.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn email_without_smtp_is_reported_not_raised() {
        let service = NotificationService::new(None);
        let deliveries = service
            .notify(&event(
                InvocationEvent::IncidentEnd,
                vec![ChannelConfig::Email {
                    to: vec!["ops@example.com".to_string()],
                }],
            ))
            .await;
        assert_eq!(deliveries.len(), 1);
        assert!(!deliveries[0].delivered);
    }
}
