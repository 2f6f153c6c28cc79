#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use sitewatch::alerting::EvaluationService;
use sitewatch::db::models::{
    Alert, CheckFrequency, HttpRequestParams, Monitor, ProbeResult, ProbeStatus,
    ResponseDescriptor, Severity, NO_RESPONSE_LATENCY,
};
use sitewatch::db::{MemoryStore, RetryPolicy};
use sitewatch::notifications::models::{AlertEvent, ChannelConfig, ChannelDelivery};
use sitewatch::notifications::AlertNotifier;
use sitewatch::probe::{ProbeExecutor, ProbeRequest};

pub const OWNER: &str = "owner-1";
pub const REGION: &str = "us-east-1";

pub fn at_minute(minute: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(minute * 60, 0).unwrap()
}

pub fn monitor(id: &str, frequency: CheckFrequency, threshold: u32, alert_ids: &[&str]) -> Monitor {
    Monitor {
        owner_id: OWNER.to_string(),
        monitor_id: id.to_string(),
        name: format!("{id} api"),
        url: format!("https://{id}.example.com/health"),
        regions: vec![REGION.to_string()],
        frequency,
        failure_threshold: threshold,
        request: HttpRequestParams::default(),
        up_conditions: Vec::new(),
        alert_ids: alert_ids.iter().map(|a| a.to_string()).collect(),
        webhook_url: None,
        created_at: at_minute(0),
        last_updated: at_minute(0),
    }
}

pub fn alert(id: &str, channels: Vec<ChannelConfig>) -> Alert {
    Alert {
        owner_id: OWNER.to_string(),
        alert_id: id.to_string(),
        name: format!("{id} on-call"),
        severity: Severity::Critical,
        channels,
        enabled: true,
    }
}

pub fn slack_channel() -> ChannelConfig {
    ChannelConfig::Slack {
        webhook_url: "https://hooks.slack.com/services/T/B/X".to_string(),
    }
}

pub fn result(monitor_id: &str, region: &str, timestamp: DateTime<Utc>, status: ProbeStatus) -> ProbeResult {
    match status {
        ProbeStatus::Up => ProbeResult {
            monitor_id: monitor_id.to_string(),
            region: region.to_string(),
            timestamp,
            status,
            latency_ms: 120,
            response: ResponseDescriptor {
                status_code: Some(200),
                message: Some("200 OK".to_string()),
            },
        },
        ProbeStatus::Down => {
            let down = ProbeResult::unreachable(monitor_id, region, timestamp, "connection refused");
            assert_eq!(down.latency_ms, NO_RESPONSE_LATENCY);
            down
        }
    }
}

/// Records every event and reports each channel as delivered.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<AlertEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify(&self, event: &AlertEvent) -> Vec<ChannelDelivery> {
        self.events.lock().unwrap().push(event.clone());
        event
            .alert
            .channels
            .iter()
            .map(|c| ChannelDelivery {
                channel_type: c.channel_type(),
                delivered: true,
                error: None,
            })
            .collect()
    }
}

/// Answers probes from a per-monitor script; an exhausted script answers up.
/// Each answer gets a distinct timestamp just after its tick.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ProbeStatus>>>,
    sequence: AtomicI64,
}

impl ScriptedExecutor {
    pub fn script(&self, monitor_id: &str, statuses: &[ProbeStatus]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(monitor_id.to_string(), statuses.iter().copied().collect());
    }
}

#[async_trait]
impl ProbeExecutor for ScriptedExecutor {
    async fn probe(&self, request: &ProbeRequest) -> ProbeResult {
        let status = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.monitor.monitor_id)
            .and_then(|s| s.pop_front())
            .unwrap_or(ProbeStatus::Up);
        let offset = self.sequence.fetch_add(1, Ordering::SeqCst);
        result(
            &request.monitor.monitor_id,
            &request.region,
            request.tick + Duration::milliseconds(offset),
            status,
        )
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, std::time::Duration::from_millis(1))
}

pub fn evaluator(store: &Arc<MemoryStore>, notifier: &Arc<RecordingNotifier>) -> EvaluationService {
    EvaluationService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        notifier.clone(),
        fast_retry(),
    )
}
