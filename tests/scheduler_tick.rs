mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use sitewatch::db::models::{CheckFrequency, InvocationEvent, Monitor, ProbeStatus};
use sitewatch::db::{AlertInvocationStore, AlertStore, MemoryStore, MonitorStore, StatusStore, StoreError};
use sitewatch::probe::ProbeRequest;
use sitewatch::scheduler::{DispatchError, ProbeDispatcher, Scheduler, SchedulerError};
use sitewatch::server::LocalCheckRunner;

use ProbeStatus::{Down, Up};

#[derive(Default)]
struct RecordingDispatcher {
    dispatched: Mutex<Vec<ProbeRequest>>,
    reject: HashSet<String>,
}

impl RecordingDispatcher {
    fn rejecting(ids: &[&str]) -> Self {
        Self {
            reject: ids.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    fn take_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .dispatched
            .lock()
            .unwrap()
            .drain(..)
            .map(|r| r.monitor.monitor_id)
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ProbeDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: ProbeRequest) -> Result<(), DispatchError> {
        if self.reject.contains(&request.monitor.monitor_id) {
            return Err(DispatchError::Rejected("queue full".to_string()));
        }
        self.dispatched.lock().unwrap().push(request);
        Ok(())
    }
}

/// A monitor store whose index reads fail with `Unavailable` a fixed number
/// of times before reaching the inner store.
struct FlakyMonitors {
    inner: MemoryStore,
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FlakyMonitors {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MonitorStore for FlakyMonitors {
    async fn get_monitor(&self, owner_id: &str, monitor_id: &str) -> Result<Monitor, StoreError> {
        self.inner.get_monitor(owner_id, monitor_id).await
    }

    async fn list_monitors_for_owner(&self, owner_id: &str) -> Result<Vec<Monitor>, StoreError> {
        self.inner.list_monitors_for_owner(owner_id).await
    }

    async fn monitors_by_frequency(
        &self,
        frequency: CheckFrequency,
        region: &str,
    ) -> Result<Vec<Monitor>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.monitors_by_frequency(frequency, region).await
    }

    async fn put_monitor(&self, monitor: &Monitor) -> Result<(), StoreError> {
        self.inner.put_monitor(monitor).await
    }

    async fn insert_monitor(&self, monitor: &Monitor) -> Result<(), StoreError> {
        self.inner.insert_monitor(monitor).await
    }

    async fn delete_monitor(&self, owner_id: &str, monitor_id: &str) -> Result<Monitor, StoreError> {
        self.inner.delete_monitor(owner_id, monitor_id).await
    }

    async fn touch_monitor(
        &self,
        owner_id: &str,
        monitor_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.touch_monitor(owner_id, monitor_id, at).await
    }
}

fn scheduler(monitors: Arc<dyn MonitorStore>, dispatcher: Arc<dyn ProbeDispatcher>) -> Scheduler {
    Scheduler::new(monitors, dispatcher, REGION, fast_retry(), Duration::from_secs(60))
}

#[tokio::test]
async fn tick_dispatches_exactly_the_due_monitors() {
    let store = Arc::new(MemoryStore::new());
    store.put_monitor(&monitor("quarter", CheckFrequency::FifteenMinutes, 1, &[])).await.unwrap();
    store.put_monitor(&monitor("minutely", CheckFrequency::OneMinute, 1, &[])).await.unwrap();
    store.put_monitor(&monitor("hourly", CheckFrequency::OneHour, 1, &[])).await.unwrap();
    let mut elsewhere = monitor("elsewhere", CheckFrequency::OneMinute, 1, &[]);
    elsewhere.regions = vec!["eu-west-1".to_string()];
    store.put_monitor(&elsewhere).await.unwrap();

    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler(store.clone(), dispatcher.clone());

    let expectations: [(i64, &[&str]); 6] = [
        (0, &["hourly", "minutely", "quarter"]),
        (7, &["minutely"]),
        (15, &["minutely", "quarter"]),
        (20, &["minutely"]),
        (45, &["minutely", "quarter"]),
        (60, &["hourly", "minutely", "quarter"]),
    ];
    for (minute, expected) in expectations {
        let report = scheduler.run_tick(at_minute(minute)).await.unwrap();
        assert_eq!(report.due, expected.len(), "minute {minute}");
        assert_eq!(report.failed, 0);
        assert_eq!(dispatcher.take_ids(), expected.to_vec(), "minute {minute}");
    }
}

#[tokio::test]
async fn failed_dispatch_does_not_block_the_rest() {
    let store = Arc::new(MemoryStore::new());
    for id in ["a", "bad", "c"] {
        store.put_monitor(&monitor(id, CheckFrequency::FiveMinutes, 1, &[])).await.unwrap();
    }
    let dispatcher = Arc::new(RecordingDispatcher::rejecting(&["bad"]));
    let scheduler = scheduler(store.clone(), dispatcher.clone());

    let report = scheduler.run_tick(at_minute(10)).await.unwrap();
    assert_eq!(report.due, 3);
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(dispatcher.take_ids(), vec!["a", "c"]);
}

#[tokio::test]
async fn persistent_store_outage_fails_the_tick() {
    let monitors = Arc::new(FlakyMonitors::new(u32::MAX));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler(monitors.clone(), dispatcher.clone());

    let err = scheduler.run_tick(at_minute(7)).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::StoreUnavailable { source: StoreError::Unavailable(_), .. }
    ));
    // Minute 7 only owes the one-minute partition; two attempts were allowed.
    assert_eq!(monitors.calls.load(Ordering::SeqCst), 2);
    assert!(dispatcher.take_ids().is_empty());
}

#[tokio::test]
async fn transient_store_outage_is_retried() {
    let monitors = Arc::new(FlakyMonitors::new(1));
    monitors
        .put_monitor(&monitor("m1", CheckFrequency::OneMinute, 1, &[]))
        .await
        .unwrap();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = scheduler(monitors.clone(), dispatcher.clone());

    let report = scheduler.run_tick(at_minute(7)).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(dispatcher.take_ids(), vec!["m1"]);
}

fn pipeline(store: &Arc<MemoryStore>, executor: &Arc<ScriptedExecutor>, notifier: &Arc<RecordingNotifier>) -> Arc<LocalCheckRunner> {
    Arc::new(LocalCheckRunner::new(
        executor.clone(),
        store.clone(),
        Arc::new(evaluator(store, notifier)),
        fast_retry(),
    ))
}

#[tokio::test]
async fn ticks_drive_probes_into_alert_transitions() {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let executor = Arc::new(ScriptedExecutor::default());
    store.put_alert(&alert("a1", vec![slack_channel()])).await.unwrap();
    store.put_monitor(&monitor("m1", CheckFrequency::FiveMinutes, 2, &["a1"])).await.unwrap();
    executor.script("m1", &[Up, Down, Down, Up, Down]);

    let runner = pipeline(&store, &executor, &notifier);
    let scheduler = scheduler(store.clone(), runner.clone());

    for minute in 0..=20 {
        scheduler.run_tick(at_minute(minute)).await.unwrap();
        runner.drain().await;
    }

    assert_eq!(store.latest_statuses("m1", 100).await.unwrap().len(), 5);
    let invocations = store.invocations_for_pair("a1", "m1").await.unwrap();
    let events: Vec<_> = invocations
        .iter()
        .map(|i| (i.event, i.timestamp.timestamp() / 60))
        .collect();
    assert_eq!(
        events,
        vec![(InvocationEvent::IncidentStart, 10), (InvocationEvent::IncidentEnd, 15)]
    );
    assert!(invocations.iter().all(|i| !i.ongoing));
    assert_eq!(notifier.events().len(), 2);
}

#[tokio::test]
async fn dispatching_a_tick_twice_never_duplicates_a_start() {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let executor = Arc::new(ScriptedExecutor::default());
    store.put_alert(&alert("a1", vec![slack_channel()])).await.unwrap();
    store.put_monitor(&monitor("m1", CheckFrequency::OneMinute, 1, &["a1"])).await.unwrap();
    executor.script("m1", &[Down, Down]);

    let runner = pipeline(&store, &executor, &notifier);
    let scheduler = scheduler(store.clone(), runner.clone());

    scheduler.run_tick(at_minute(3)).await.unwrap();
    scheduler.run_tick(at_minute(3)).await.unwrap();
    runner.drain().await;

    assert_eq!(store.latest_statuses("m1", 10).await.unwrap().len(), 2);
    let invocations = store.invocations_for_pair("a1", "m1").await.unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].event, InvocationEvent::IncidentStart);
    assert!(invocations[0].ongoing);
    assert_eq!(notifier.events().len(), 1);
}

#[tokio::test]
async fn inline_check_reports_result_and_evaluation() {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let executor = Arc::new(ScriptedExecutor::default());
    store.put_alert(&alert("a1", vec![slack_channel()])).await.unwrap();
    let m = monitor("m1", CheckFrequency::OneMinute, 1, &["a1"]);
    executor.script("m1", &[Down]);

    let runner = pipeline(&store, &executor, &notifier);
    let outcome = runner
        .process(&ProbeRequest {
            monitor: m,
            region: REGION.to_string(),
            tick: at_minute(1),
        })
        .await
        .unwrap();

    assert_eq!(outcome.result.status, Down);
    assert_eq!(outcome.result.latency(), None);
    assert_eq!(outcome.evaluation.raised(), 1);
    assert!(store.get_alert(OWNER, "a1").await.is_ok());
}
