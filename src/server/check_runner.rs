//! In-process probe pipeline: probe, record, evaluate.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::alerting::{EvaluationReport, EvaluationService};
use crate::db::models::ProbeResult;
use crate::db::{with_retry, RetryPolicy, StatusStore};
use crate::probe::{ProbeExecutor, ProbeRequest};
use crate::scheduler::{DispatchError, ProbeDispatcher};

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub result: ProbeResult,
    pub evaluation: EvaluationReport,
}

#[derive(Clone)]
struct CheckPipeline {
    executor: Arc<dyn ProbeExecutor>,
    statuses: Arc<dyn StatusStore>,
    evaluator: Arc<EvaluationService>,
    retry: RetryPolicy,
}

impl CheckPipeline {
    async fn process(&self, request: &ProbeRequest) -> Result<CheckOutcome, DispatchError> {
        let result = self.executor.probe(request).await;
        debug!(
            monitor_id = %result.monitor_id,
            region = %result.region,
            status = result.status.as_str(),
            latency_ms = result.latency_ms,
            "Probe finished."
        );

        with_retry(&self.retry, "append_status", || {
            self.statuses.append_status(&result)
        })
        .await?;

        let evaluation = self.evaluator.evaluate(&request.monitor, &result).await?;
        Ok(CheckOutcome { result, evaluation })
    }
}

/// Runs each dispatched check in its own task on this process.
pub struct LocalCheckRunner {
    pipeline: CheckPipeline,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalCheckRunner {
    pub fn new(
        executor: Arc<dyn ProbeExecutor>,
        statuses: Arc<dyn StatusStore>,
        evaluator: Arc<EvaluationService>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pipeline: CheckPipeline {
                executor,
                statuses,
                evaluator,
                retry,
            },
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Runs one check inline and returns what it produced.
    pub async fn process(&self, request: &ProbeRequest) -> Result<CheckOutcome, DispatchError> {
        self.pipeline.process(request).await
    }

    /// Waits for every check dispatched so far.
    pub async fn drain(&self) {
        let handles = match self.in_flight.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Check task panicked.");
            }
        }
    }
}

#[async_trait]
impl ProbeDispatcher for LocalCheckRunner {
    async fn dispatch(&self, request: ProbeRequest) -> Result<(), DispatchError> {
        let pipeline = self.pipeline.clone();
        let handle = tokio::spawn(async move {
            let monitor_id = request.monitor.monitor_id.clone();
            if let Err(e) = pipeline.process(&request).await {
                warn!(monitor_id = %monitor_id, region = %request.region, error = %e, "Check failed.");
            }
        });

        let mut guard = self
            .in_flight
            .lock()
            .map_err(|_| DispatchError::Task("in-flight registry poisoned".to_string()))?;
        guard.retain(|h| !h.is_finished());
        guard.push(handle);
        Ok(())
    }
}
