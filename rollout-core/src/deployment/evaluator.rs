use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aggregate::AggregatedDeploymentMetrics;
use super::model::RollbackThresholds;

/// Signals the rollback evaluator watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoredSignal {
    ErrorRate,
    LatencyP95Ms,
    SafetyIncidentRate,
}

impl MonitoredSignal {
    /// Threshold name used in violation records and rollback reasons.
    pub fn threshold_name(&self) -> &'static str {
        match self {
            MonitoredSignal::ErrorRate => "max_error_rate",
            MonitoredSignal::LatencyP95Ms => "max_latency_p95_ms",
            MonitoredSignal::SafetyIncidentRate => "max_safety_incident_rate",
        }
    }
}

impl std::fmt::Display for MonitoredSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.threshold_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

/// One recorded breach of a rollback threshold in a single evaluation
/// cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdViolation {
    pub metric: MonitoredSignal,
    pub observed_value: f64,
    pub threshold_value: f64,
    pub severity: ViolationSeverity,
    pub window_end: DateTime<Utc>,
}

/// Terminal decision produced once a signal has breached for enough
/// consecutive cycles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackVerdict {
    pub signal: MonitoredSignal,
    pub violation: ThresholdViolation,
    pub consecutive_cycles: u32,
    /// Human-readable reason handed verbatim to `Controller::rollback`.
    pub reason: String,
}

/// Outcome of evaluating one aggregate snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub violations: Vec<ThresholdViolation>,
    pub verdict: Option<RollbackVerdict>,
}

/// Compares aggregate snapshots against the configured thresholds and
/// debounces transient spikes: a signal must breach on consecutive cycles
/// to trigger, and one clean cycle resets its streak.
#[derive(Debug)]
pub struct RollbackEvaluator {
    thresholds: RollbackThresholds,
    streaks: HashMap<MonitoredSignal, u32>,
}

impl RollbackEvaluator {
    pub fn new(thresholds: RollbackThresholds) -> Self {
        Self {
            thresholds,
            streaks: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, metrics: &AggregatedDeploymentMetrics) -> EvaluationOutcome {
        let checks = [
            (
                MonitoredSignal::ErrorRate,
                metrics.error_rate,
                self.thresholds.max_error_rate,
            ),
            (
                MonitoredSignal::LatencyP95Ms,
                metrics.latency_p95_ms,
                self.thresholds.max_latency_p95_ms,
            ),
            (
                MonitoredSignal::SafetyIncidentRate,
                metrics.safety_incident_rate,
                self.thresholds.max_safety_incident_rate,
            ),
        ];

        let mut violations = Vec::new();
        let mut verdict: Option<RollbackVerdict> = None;

        for (signal, observed, threshold) in checks {
            if observed > threshold {
                let severity = if observed >= threshold * 2.0 {
                    ViolationSeverity::Critical
                } else {
                    ViolationSeverity::Warning
                };
                let violation = ThresholdViolation {
                    metric: signal,
                    observed_value: observed,
                    threshold_value: threshold,
                    severity,
                    window_end: metrics.window_end,
                };
                let streak = self.streaks.entry(signal).or_insert(0);
                *streak += 1;
                if verdict.is_none() && *streak >= self.thresholds.consecutive_violations_to_trigger
                {
                    verdict = Some(RollbackVerdict {
                        signal,
                        violation: violation.clone(),
                        consecutive_cycles: *streak,
                        reason: format!(
                            "automatic rollback: {} observed {:.4} exceeded threshold {:.4} for {} consecutive evaluation cycles",
                            signal.threshold_name(),
                            observed,
                            threshold,
                            streak,
                        ),
                    });
                }
                violations.push(violation);
            } else {
                // Clean cycle: the streak resets, a lone spike never
                // accumulates toward rollback.
                self.streaks.insert(signal, 0);
            }
        }

        EvaluationOutcome {
            violations,
            verdict,
        }
    }

    /// Current streak for a signal; zero when it has never breached.
    pub fn streak(&self, signal: MonitoredSignal) -> u32 {
        self.streaks.get(&signal).copied().unwrap_or(0)
    }
}
