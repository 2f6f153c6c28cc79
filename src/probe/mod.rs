//! Probe execution: one HTTP check of a monitor from one region.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{Monitor, ProbeResult};

pub mod conditions;
pub mod http;

pub use http::HttpProbeExecutor;

/// One unit of scheduled work.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub monitor: Monitor,
    pub region: String,
    /// Tick that made the monitor due.
    pub tick: DateTime<Utc>,
}

/// Runs a probe. Network failures and timeouts are reported as a `down`
/// result with [`crate::db::models::NO_RESPONSE_LATENCY`], never as errors.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> ProbeResult;
}
