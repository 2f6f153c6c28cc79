use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::models::{Alert, AlertInvocation, InvocationEvent, Monitor, ProbeResult, ProbeStatus};
use crate::db::{
    with_retry, AlertInvocationStore, AlertStore, MonitorStore, RetryPolicy, StatusStore,
    StoreError,
};
use crate::notifications::models::{AlertEvent, ChannelDelivery};
use crate::notifications::AlertNotifier;

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Alert state of one `(alert_id, monitor_id)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertState {
    Healthy,
    /// Carries the open `incident_start`.
    Failing(AlertInvocation),
}

impl AlertState {
    pub fn from_open(open: Option<AlertInvocation>) -> Self {
        match open {
            Some(invocation) => AlertState::Failing(invocation),
            None => AlertState::Healthy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Raise,
    Resolve,
    Stay,
}

/// Decides the transition for a pair from its state and the monitor's most
/// recent statuses, newest first.
///
/// Raising needs at least `threshold` results, all down. Fewer results is
/// insufficient evidence. Resolving needs only the newest result to be up.
pub fn decide(state: &AlertState, recent: &[ProbeStatus], threshold: usize) -> Transition {
    let threshold = threshold.max(1);
    match state {
        AlertState::Healthy => {
            let failing_run = recent.len() >= threshold
                && recent[..threshold].iter().all(|s| *s == ProbeStatus::Down);
            if failing_run {
                Transition::Raise
            } else {
                Transition::Stay
            }
        }
        AlertState::Failing(_) => match recent.first() {
            Some(ProbeStatus::Up) => Transition::Resolve,
            _ => Transition::Stay,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Raised(Vec<ChannelDelivery>),
    Resolved(Vec<ChannelDelivery>),
    Unchanged,
    /// Another evaluator made the transition first.
    LostRace,
    AlertMissing,
    AlertDisabled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairReport {
    pub alert_id: String,
    pub outcome: PairOutcome,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvaluationReport {
    pub monitor_id: String,
    pub pairs: Vec<PairReport>,
}

impl EvaluationReport {
    pub fn raised(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Raised(_)))
    }

    pub fn resolved(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Resolved(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&PairOutcome) -> bool) -> usize {
        self.pairs.iter().filter(|p| pred(&p.outcome)).count()
    }
}

enum PairLoad {
    Live(Alert, AlertState),
    Settled(PairOutcome),
}

/// Drives the per-pair state machine after each status write.
pub struct EvaluationService {
    alerts: Arc<dyn AlertStore>,
    invocations: Arc<dyn AlertInvocationStore>,
    statuses: Arc<dyn StatusStore>,
    monitors: Option<Arc<dyn MonitorStore>>,
    notifier: Arc<dyn AlertNotifier>,
    retry: RetryPolicy,
}

impl EvaluationService {
    pub fn new(
        alerts: Arc<dyn AlertStore>,
        invocations: Arc<dyn AlertInvocationStore>,
        statuses: Arc<dyn StatusStore>,
        notifier: Arc<dyn AlertNotifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            alerts,
            invocations,
            statuses,
            monitors: None,
            notifier,
            retry,
        }
    }

    /// Stamps `last_updated` on the monitor whenever one of its alerts
    /// changes state.
    pub fn with_monitor_store(mut self, monitors: Arc<dyn MonitorStore>) -> Self {
        self.monitors = Some(monitors);
        self
    }

    /// Evaluates every alert attached to `monitor` after `result` was stored.
    ///
    /// Pairs are isolated: a failing pair is reported in its `PairOutcome`.
    /// Only failing to read the status history fails the whole evaluation.
    ///
    /// Each pair's state is read before the status history. A resolve that
    /// lands before the state read has already written its `up`, so the
    /// history read afterwards sees it and a stale run of downs cannot raise.
    pub async fn evaluate(
        &self,
        monitor: &Monitor,
        result: &ProbeResult,
    ) -> Result<EvaluationReport, EvaluationError> {
        let mut report = EvaluationReport {
            monitor_id: monitor.monitor_id.clone(),
            pairs: Vec::with_capacity(monitor.alert_ids.len()),
        };
        if monitor.alert_ids.is_empty() {
            return Ok(report);
        }

        let mut loaded = Vec::with_capacity(monitor.alert_ids.len());
        for alert_id in &monitor.alert_ids {
            let load = match self.load_pair(monitor, alert_id).await {
                Ok(load) => load,
                Err(e) => {
                    error!(monitor_id = %monitor.monitor_id, alert_id = %alert_id, error = %e, "Failed to load alert state.");
                    PairLoad::Settled(PairOutcome::Failed(e.to_string()))
                }
            };
            loaded.push((alert_id, load));
        }

        let threshold = monitor.effective_threshold();
        let any_live = loaded.iter().any(|(_, l)| matches!(l, PairLoad::Live(..)));
        let recent: Vec<ProbeStatus> = if any_live {
            with_retry(&self.retry, "latest_statuses", || {
                self.statuses.latest_statuses(&monitor.monitor_id, threshold)
            })
            .await?
            .into_iter()
            .map(|r| r.status)
            .collect()
        } else {
            Vec::new()
        };

        for (alert_id, load) in loaded {
            let outcome = match load {
                PairLoad::Settled(outcome) => outcome,
                PairLoad::Live(alert, state) => {
                    match self.apply(monitor, alert, state, &recent, result).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(monitor_id = %monitor.monitor_id, alert_id = %alert_id, error = %e, "Alert evaluation failed.");
                            PairOutcome::Failed(e.to_string())
                        }
                    }
                }
            };
            report.pairs.push(PairReport {
                alert_id: alert_id.clone(),
                outcome,
            });
        }

        if report.raised() + report.resolved() > 0 {
            self.touch_monitor(monitor, result.timestamp).await;
        }
        Ok(report)
    }

    async fn load_pair(&self, monitor: &Monitor, alert_id: &str) -> Result<PairLoad, EvaluationError> {
        let alert = match with_retry(&self.retry, "get_alert", || {
            self.alerts.get_alert(&monitor.owner_id, alert_id)
        })
        .await
        {
            Ok(alert) => alert,
            Err(StoreError::NotFound(_)) => {
                warn!(monitor_id = %monitor.monitor_id, alert_id, "Monitor references a missing alert.");
                return Ok(PairLoad::Settled(PairOutcome::AlertMissing));
            }
            Err(e) => return Err(e.into()),
        };
        if !alert.enabled {
            debug!(monitor_id = %monitor.monitor_id, alert_id, "Alert disabled, skipping.");
            return Ok(PairLoad::Settled(PairOutcome::AlertDisabled));
        }

        let open = with_retry(&self.retry, "open_invocation", || {
            self.invocations.open_invocation(alert_id, &monitor.monitor_id)
        })
        .await?;
        Ok(PairLoad::Live(alert, AlertState::from_open(open)))
    }

    async fn apply(
        &self,
        monitor: &Monitor,
        alert: Alert,
        state: AlertState,
        recent: &[ProbeStatus],
        result: &ProbeResult,
    ) -> Result<PairOutcome, EvaluationError> {
        match (decide(&state, recent, monitor.effective_threshold()), state) {
            (Transition::Raise, _) => self.raise(monitor, alert, result).await,
            (Transition::Resolve, AlertState::Failing(open)) => {
                self.resolve(monitor, alert, open, result).await
            }
            _ => Ok(PairOutcome::Unchanged),
        }
    }

    async fn raise(
        &self,
        monitor: &Monitor,
        alert: Alert,
        result: &ProbeResult,
    ) -> Result<PairOutcome, EvaluationError> {
        let start = AlertInvocation::incident_start(&alert, &monitor.monitor_id, result.timestamp);
        match with_retry(&self.retry, "start_incident", || {
            self.invocations.start_incident(&start)
        })
        .await
        {
            Ok(()) => {}
            Err(e) if e.is_condition_failed() => {
                debug!(monitor_id = %monitor.monitor_id, alert_id = %alert.alert_id, "Incident already open or superseded, lost the race.");
                return Ok(PairOutcome::LostRace);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            monitor_id = %monitor.monitor_id,
            alert_id = %alert.alert_id,
            threshold = monitor.effective_threshold(),
            "Incident started."
        );
        let deliveries = self
            .notify(InvocationEvent::IncidentStart, start.timestamp, alert, monitor, result)
            .await;
        Ok(PairOutcome::Raised(deliveries))
    }

    async fn resolve(
        &self,
        monitor: &Monitor,
        alert: Alert,
        open: AlertInvocation,
        result: &ProbeResult,
    ) -> Result<PairOutcome, EvaluationError> {
        // The end row must sort after the start it closes.
        let ended_at = result
            .timestamp
            .max(open.timestamp + Duration::milliseconds(1));
        let end = AlertInvocation::incident_end(&alert, &monitor.monitor_id, ended_at);
        match with_retry(&self.retry, "end_incident", || {
            self.invocations.end_incident(&open, &end)
        })
        .await
        {
            Ok(()) => {}
            Err(e) if e.is_condition_failed() => {
                debug!(monitor_id = %monitor.monitor_id, alert_id = %alert.alert_id, "Incident already closed, lost the race.");
                return Ok(PairOutcome::LostRace);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            monitor_id = %monitor.monitor_id,
            alert_id = %alert.alert_id,
            started_at = %open.timestamp,
            "Incident resolved."
        );
        let deliveries = self
            .notify(InvocationEvent::IncidentEnd, ended_at, alert, monitor, result)
            .await;
        Ok(PairOutcome::Resolved(deliveries))
    }

    async fn notify(
        &self,
        event: InvocationEvent,
        timestamp: DateTime<Utc>,
        alert: Alert,
        monitor: &Monitor,
        result: &ProbeResult,
    ) -> Vec<ChannelDelivery> {
        let event = AlertEvent {
            event,
            timestamp,
            alert,
            monitor: monitor.clone(),
            detail: result.response.message.clone(),
        };
        self.notifier.notify(&event).await
    }

    async fn touch_monitor(&self, monitor: &Monitor, at: DateTime<Utc>) {
        let Some(monitors) = &self.monitors else {
            return;
        };
        if let Err(e) = monitors
            .touch_monitor(&monitor.owner_id, &monitor.monitor_id, at)
            .await
        {
            warn!(monitor_id = %monitor.monitor_id, error = %e, "Failed to update monitor last_updated.");
        }
    }
}
