use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use std::time::{Duration, Instant};
use tracing::debug;

use super::conditions::{self, ObservedResponse};
use super::{ProbeExecutor, ProbeRequest};
use crate::db::models::{ProbeResult, ProbeStatus, ResponseDescriptor};

/// Probes monitors over HTTP(S) with a bounded per-probe budget.
pub struct HttpProbeExecutor {
    client: Client,
    timeout: Duration,
}

struct Answered {
    status: StatusCode,
    latency_ms: u64,
    body: Option<String>,
}

impl HttpProbeExecutor {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let timeout = timeout.max(Duration::from_secs(1));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sitewatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }

    async fn send(&self, request: &ProbeRequest) -> Result<Answered, String> {
        let params = &request.monitor.request;
        let method = Method::from_bytes(params.method.to_uppercase().as_bytes())
            .map_err(|_| format!("Invalid HTTP method: {}", params.method))?;

        let mut builder = self.client.request(method, &request.monitor.url);
        for (name, value) in &params.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &params.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                "Request timed out".to_string()
            } else {
                format!("Request failed: {e}")
            }
        })?;
        let latency_ms = started.elapsed().as_millis() as u64;
        let status = response.status();

        let body = if conditions::needs_body(&request.monitor.up_conditions) {
            match response.text().await {
                Ok(text) => Some(text),
                Err(e) => {
                    debug!(monitor_id = %request.monitor.monitor_id, error = %e, "Failed to read probe response body.");
                    None
                }
            }
        } else {
            None
        };

        Ok(Answered {
            status,
            latency_ms,
            body,
        })
    }
}

#[async_trait]
impl ProbeExecutor for HttpProbeExecutor {
    async fn probe(&self, request: &ProbeRequest) -> ProbeResult {
        let monitor_id = &request.monitor.monitor_id;
        let timestamp = Utc::now();

        let answered = match tokio::time::timeout(self.timeout, self.send(request)).await {
            Ok(Ok(answered)) => answered,
            Ok(Err(message)) => {
                return ProbeResult::unreachable(monitor_id, &request.region, timestamp, message)
            }
            Err(_) => {
                return ProbeResult::unreachable(
                    monitor_id,
                    &request.region,
                    timestamp,
                    format!("Probe exceeded {}s budget", self.timeout.as_secs()),
                )
            }
        };

        let observed = ObservedResponse {
            status_code: answered.status.as_u16(),
            latency_ms: answered.latency_ms,
            body: answered.body.as_deref(),
        };
        let (status, message) = match conditions::check(&request.monitor.up_conditions, &observed) {
            Ok(()) => (ProbeStatus::Up, answered.status.to_string()),
            Err(violation) => (ProbeStatus::Down, violation),
        };

        ProbeResult {
            monitor_id: monitor_id.clone(),
            region: request.region.clone(),
            timestamp,
            status,
            latency_ms: answered.latency_ms as i64,
            response: ResponseDescriptor {
                status_code: Some(observed.status_code),
                message: Some(message),
            },
        }
    }
}
