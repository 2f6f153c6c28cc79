use async_trait::async_trait;
use reqwest::{header, Client, Method};
use std::collections::HashMap;
use tera::{Context, Tera};

use super::{ensure_success, NotificationSender, SenderError};
use crate::notifications::models::ChannelConfig;

/// A sender for pushing alert events to a custom webhook.
pub struct WebhookSender {
    client: Client,
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl WebhookSender {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Renders the POST body: the channel's template if set, otherwise a JSON
    /// object of the event context with `message` added.
    pub fn render_body(
        body_template: Option<&str>,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<String, SenderError> {
        match body_template {
            Some(template) => {
                let mut tera_context = Context::new();
                for (key, value) in context {
                    tera_context.insert(key, value);
                }
                tera_context.insert("message", message);
                Tera::one_off(template, &tera_context, false)
                    .map_err(|e| SenderError::TemplatingError(e.to_string()))
            }
            None => {
                let mut payload: serde_json::Map<String, serde_json::Value> = context
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect();
                payload.insert("message".to_string(), serde_json::Value::String(message.to_string()));
                serde_json::to_string(&payload)
                    .map_err(|e| SenderError::TemplatingError(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(
        &self,
        config: &ChannelConfig,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<(), SenderError> {
        let (url, method, headers, body_template) = match config {
            ChannelConfig::Webhook {
                url,
                method,
                headers,
                body_template,
            } => (url, method, headers, body_template),
            _ => {
                return Err(SenderError::InvalidConfiguration(
                    "Expected Webhook config, but found a different type.".to_string(),
                ));
            }
        };

        let http_method = match method.to_uppercase().as_str() {
            "POST" => Method::POST,
            "GET" => Method::GET,
            _ => {
                return Err(SenderError::InvalidConfiguration(format!(
                    "Unsupported HTTP method: {method}"
                )));
            }
        };

        let mut request_builder = self.client.request(http_method.clone(), url);

        if let Some(h) = headers {
            let mut header_map = header::HeaderMap::new();
            for (key, value) in h {
                let header_name = header::HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                    SenderError::InvalidConfiguration(format!("Invalid header name: {e}"))
                })?;
                let header_value = header::HeaderValue::from_str(value).map_err(|e| {
                    SenderError::InvalidConfiguration(format!("Invalid header value: {e}"))
                })?;
                header_map.insert(header_name, header_value);
            }
            request_builder = request_builder.headers(header_map);
        }

        if http_method == Method::POST {
            let rendered_body = Self::render_body(body_template.as_deref(), message, context)?;
            request_builder = request_builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(rendered_body);
        }

        let response = request_builder.send().await?;
        ensure_success("Webhook", response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        ctx.insert("monitor_name".to_string(), "api".to_string());
        ctx.insert("event".to_string(), "incident_start".to_string());
        ctx
    }

    #[test]
    fn renders_custom_template() {
        let body = WebhookSender::render_body(
            Some(r#"{"text": "{{ monitor_name }} {{ event }}: {{ message }}"}"#),
            "down",
            &context(),
        )
        .unwrap();
        assert_eq!(body, r#"{"text": "api incident_start: down"}"#);
    }

    #[test]
    fn default_body_is_the_context_as_json() {
        let body = WebhookSender::render_body(None, "api is down", &context()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["monitor_name"], "api");
        assert_eq!(value["message"], "api is down");
    }

    #[test]
    fn broken_template_is_a_templating_error() {
        let result = WebhookSender::render_body(Some("{{ unclosed"), "m", &context());
        assert!(matches!(result, Err(SenderError::TemplatingError(_))));
    }
}
