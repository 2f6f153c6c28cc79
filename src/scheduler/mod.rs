//! Tick-driven scheduling.
//!
//! Which monitors are due is a pure function of the tick: a monitor with
//! frequency `f` minutes runs at tick `T` iff `minutes_since_epoch(T) % f == 0`.
//! Nothing about past ticks is remembered, so a restarted or retried tick
//! recomputes exactly the same due set.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerting::EvaluationError;
use crate::db::models::{CheckFrequency, Monitor};
use crate::db::{with_retry, MonitorStore, RetryPolicy, StoreError};
use crate::probe::ProbeRequest;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Dispatch rejected: {0}")]
    Rejected(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
    #[error("Check task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Monitor store unavailable for tick {tick}: {source}")]
    StoreUnavailable {
        tick: DateTime<Utc>,
        #[source]
        source: StoreError,
    },
}

/// Hands one due `(monitor, region)` pair to the probe pipeline.
#[async_trait]
pub trait ProbeDispatcher: Send + Sync {
    async fn dispatch(&self, request: ProbeRequest) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick: DateTime<Utc>,
    pub due: usize,
    pub dispatched: usize,
    pub failed: usize,
}

pub fn minutes_since_epoch(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(60)
}

/// Truncates `t` to the start of its minute.
pub fn align_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(minutes_since_epoch(t) * 60, 0)
        .single()
        .unwrap_or(t)
}

pub fn is_due(frequency: CheckFrequency, tick: DateTime<Utc>) -> bool {
    minutes_since_epoch(tick).rem_euclid(i64::from(frequency.minutes())) == 0
}

pub fn due_frequencies(tick: DateTime<Utc>) -> Vec<CheckFrequency> {
    CheckFrequency::ALL
        .into_iter()
        .filter(|f| is_due(*f, tick))
        .collect()
}

/// The probe requests `region` owes at `tick`, one per due monitor serving
/// that region.
pub fn due_set(tick: DateTime<Utc>, monitors: &[Monitor], region: &str) -> Vec<ProbeRequest> {
    monitors
        .iter()
        .filter(|m| is_due(m.frequency, tick) && m.regions.iter().any(|r| r == region))
        .map(|m| ProbeRequest {
            monitor: m.clone(),
            region: region.to_string(),
            tick,
        })
        .collect()
}

pub struct Scheduler {
    monitors: Arc<dyn MonitorStore>,
    dispatcher: Arc<dyn ProbeDispatcher>,
    region: String,
    retry: RetryPolicy,
    tick_period: Duration,
}

impl Scheduler {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        dispatcher: Arc<dyn ProbeDispatcher>,
        region: impl Into<String>,
        retry: RetryPolicy,
        tick_period: Duration,
    ) -> Self {
        Self {
            monitors,
            dispatcher,
            region: region.into(),
            retry,
            tick_period,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Runs one tick: reads the frequency index for every due frequency,
    /// then dispatches all due pairs concurrently. A failed dispatch is
    /// counted and logged; only an unreadable index fails the tick.
    pub async fn run_tick(&self, tick: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let tick = align_to_minute(tick);
        let mut candidates = Vec::new();
        for frequency in due_frequencies(tick) {
            let monitors = with_retry(&self.retry, "monitors_by_frequency", || {
                self.monitors.monitors_by_frequency(frequency, &self.region)
            })
            .await
            .map_err(|source| SchedulerError::StoreUnavailable { tick, source })?;
            candidates.extend(monitors);
        }

        let requests = due_set(tick, &candidates, &self.region);
        let due = requests.len();
        debug!(%tick, region = %self.region, due, "Dispatching due monitors.");

        let outcomes = join_all(requests.into_iter().map(|request| async move {
            let monitor_id = request.monitor.monitor_id.clone();
            let outcome = self.dispatcher.dispatch(request).await;
            (monitor_id, outcome)
        }))
        .await;

        let mut failed = 0;
        for (monitor_id, outcome) in outcomes {
            if let Err(e) = outcome {
                failed += 1;
                warn!(%tick, region = %self.region, monitor_id = %monitor_id, error = %e, "Dispatch failed; deferring to the next due tick.");
            }
        }

        let report = TickReport {
            tick,
            due,
            dispatched: due - failed,
            failed,
        };
        info!(
            %tick,
            region = %self.region,
            due = report.due,
            dispatched = report.dispatched,
            failed = report.failed,
            "Tick complete."
        );
        Ok(report)
    }

    /// Ticks on period boundaries until `shutdown` resolves. Each tick runs in
    /// its own task bounded by the period; missed ticks are skipped, never
    /// replayed.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let period = self.tick_period.max(Duration::from_secs(1));
        info!(region = %self.region, period_seconds = period.as_secs(), "Scheduler started.");

        let mut ticker = interval_at(Instant::now() + until_next_boundary(Utc::now(), period), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        // Config requires the period to divide 60 s, so a sub-minute period
        // wakes several times per minute; only the first wake-up dispatches.
        let mut last_tick: Option<DateTime<Utc>> = None;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(region = %self.region, "Scheduler stopping.");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let tick = align_to_minute(Utc::now());
            if last_tick == Some(tick) {
                debug!(%tick, "Minute already ticked, skipping.");
                continue;
            }
            last_tick = Some(tick);

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                match tokio::time::timeout(period, this.run_tick(tick)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(%tick, error = %e, "Tick failed; skipping."),
                    Err(_) => warn!(%tick, "Tick exceeded its period; undispatched monitors deferred."),
                }
            });
        }
    }
}

fn until_next_boundary(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let into_period = now.timestamp_millis().rem_euclid(period_ms);
    Duration::from_millis((period_ms - into_period) as u64)
}
