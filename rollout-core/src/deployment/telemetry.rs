use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type TelemetryResult<T> = std::result::Result<T, TelemetryError>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telemetry endpoint returned status {status} for robot {robot_id}")]
    Endpoint { status: u16, robot_id: String },
}

/// One robot's windowed operational summary as reported by the telemetry
/// collaborator. Latency percentiles are computed robot-side; the
/// aggregator only merges them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotMetricsSummary {
    pub robot_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sample_count: u64,
    pub error_count: u64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub safety_incidents: u64,
    pub reported_at: DateTime<Utc>,
}

impl RobotMetricsSummary {
    /// A clean summary for tests and fixtures.
    pub fn healthy(robot_id: impl Into<String>, sample_count: u64) -> Self {
        let now = Utc::now();
        Self {
            robot_id: robot_id.into(),
            window_start: now - Duration::minutes(5),
            window_end: now,
            sample_count,
            error_count: 0,
            latency_p50_ms: 120.0,
            latency_p95_ms: 310.0,
            safety_incidents: 0,
            reported_at: now,
        }
    }

    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_count = (self.sample_count as f64 * rate).round() as u64;
        self
    }

    pub fn with_latency_p95(mut self, p95_ms: f64) -> Self {
        self.latency_p95_ms = p95_ms;
        self
    }

    pub fn with_safety_incidents(mut self, incidents: u64) -> Self {
        self.safety_incidents = incidents;
        self
    }

    pub fn with_reported_at(mut self, reported_at: DateTime<Utc>) -> Self {
        self.window_end = reported_at;
        self.window_start = reported_at - Duration::minutes(5);
        self.reported_at = reported_at;
        self
    }

    pub fn error_rate(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.sample_count as f64
        }
    }
}

/// Source of per-robot metric summaries. The controller only depends on
/// this contract; production wires the HTTP implementation, tests wire the
/// mock.
#[async_trait]
pub trait TelemetryService: Send + Sync {
    /// Fetch summaries for the given robots over the trailing window.
    /// Robots with no data in the window are simply absent from the result.
    async fn robot_summaries(
        &self,
        robot_ids: &[String],
        window: Duration,
    ) -> TelemetryResult<Vec<RobotMetricsSummary>>;
}

/// Telemetry client talking to the fleet telemetry gateway over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTelemetryService {
    client: Client,
    base_url: String,
}

impl HttpTelemetryService {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_one(
        &self,
        robot_id: &str,
        window_seconds: i64,
    ) -> TelemetryResult<Option<RobotMetricsSummary>> {
        let url = format!("{}/robots/{}/metrics", self.base_url, robot_id);
        let response = self
            .client
            .get(&url)
            .query(&[("window_seconds", window_seconds)])
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(Some(response.json().await?)),
            status if status.as_u16() == 404 => Ok(None),
            status => Err(TelemetryError::Endpoint {
                status: status.as_u16(),
                robot_id: robot_id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl TelemetryService for HttpTelemetryService {
    async fn robot_summaries(
        &self,
        robot_ids: &[String],
        window: Duration,
    ) -> TelemetryResult<Vec<RobotMetricsSummary>> {
        let window_seconds = window.num_seconds();
        let fetches = robot_ids
            .iter()
            .map(|robot_id| self.fetch_one(robot_id, window_seconds));
        let mut summaries = Vec::with_capacity(robot_ids.len());
        for result in join_all(fetches).await {
            if let Some(summary) = result? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }
}

/// Scripted telemetry source for tests: cycles are popped in order, and
/// once the script is exhausted every requested robot reports healthy.
#[derive(Debug, Default)]
pub struct MockTelemetryService {
    cycles: Mutex<VecDeque<Vec<RobotMetricsSummary>>>,
}

impl MockTelemetryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the summaries one monitoring cycle will observe.
    pub fn push_cycle(&self, summaries: Vec<RobotMetricsSummary>) {
        self.cycles
            .lock()
            .expect("telemetry mock lock poisoned")
            .push_back(summaries);
    }

    pub fn scripted_cycles_remaining(&self) -> usize {
        self.cycles
            .lock()
            .expect("telemetry mock lock poisoned")
            .len()
    }
}

#[async_trait]
impl TelemetryService for MockTelemetryService {
    async fn robot_summaries(
        &self,
        robot_ids: &[String],
        _window: Duration,
    ) -> TelemetryResult<Vec<RobotMetricsSummary>> {
        let scripted = self
            .cycles
            .lock()
            .expect("telemetry mock lock poisoned")
            .pop_front();
        match scripted {
            Some(summaries) => Ok(summaries),
            None => Ok(robot_ids
                .iter()
                .map(|id| RobotMetricsSummary::healthy(id.clone(), 200))
                .collect()),
        }
    }
}
