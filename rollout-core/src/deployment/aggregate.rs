use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::model::RollbackThresholds;
use super::telemetry::RobotMetricsSummary;

/// Fleet-wide reduction of the canary robots' summaries for one
/// monitoring window. Signal values are weighted by sample count so a
/// noisy robot with few samples cannot dominate the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedDeploymentMetrics {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub robots_reporting: usize,
    /// Robots whose summaries carried too few samples to be trusted.
    pub robots_discarded: usize,
    /// Robots that missed this window but were heard from recently.
    pub stale_robots: Vec<String>,
    /// Robots silent beyond the alert window; surfaced for operators,
    /// never counted as a threshold breach.
    pub silent_robots: Vec<String>,
    pub total_samples: u64,
    pub error_rate: f64,
    pub latency_p95_ms: f64,
    pub safety_incident_rate: f64,
}

/// Result of one aggregation cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationOutcome {
    Aggregated(AggregatedDeploymentMetrics),
    /// Too few trusted reporters; the cycle is skipped rather than
    /// allowed to produce a false verdict.
    InsufficientQuorum { reporting: usize, required: usize },
}

/// Per-deployment aggregator. Owned by the monitoring loop; tracks when
/// each robot was last heard from so missed windows can be told apart
/// from persistent silence.
#[derive(Debug)]
pub struct MetricsAggregator {
    stale_after: Duration,
    silence_alert_after: Duration,
    last_seen: HashMap<String, DateTime<Utc>>,
    tracking_since: DateTime<Utc>,
}

impl MetricsAggregator {
    pub fn new(stale_after: Duration, silence_alert_after: Duration) -> Self {
        Self {
            stale_after,
            silence_alert_after,
            last_seen: HashMap::new(),
            tracking_since: Utc::now(),
        }
    }

    /// Reduce one cycle's summaries for the expected robot set.
    ///
    /// Robots below the sample floor are discarded; robots missing or
    /// stale this window are flagged but never treated as violations.
    pub fn reduce(
        &mut self,
        now: DateTime<Utc>,
        expected_robots: &[String],
        summaries: Vec<RobotMetricsSummary>,
        thresholds: &RollbackThresholds,
    ) -> AggregationOutcome {
        let mut by_robot: HashMap<&str, &RobotMetricsSummary> = HashMap::new();
        for summary in &summaries {
            self.last_seen
                .entry(summary.robot_id.clone())
                .and_modify(|seen| {
                    if summary.reported_at > *seen {
                        *seen = summary.reported_at;
                    }
                })
                .or_insert(summary.reported_at);
            by_robot.insert(summary.robot_id.as_str(), summary);
        }

        let mut kept: Vec<&RobotMetricsSummary> = Vec::new();
        let mut discarded = 0usize;
        let mut stale_robots = Vec::new();
        let mut silent_robots = Vec::new();

        for robot_id in expected_robots {
            let fresh = by_robot
                .get(robot_id.as_str())
                .copied()
                .filter(|summary| now - summary.reported_at <= self.stale_after);
            match fresh {
                Some(summary) if summary.sample_count >= thresholds.min_sample_size => {
                    kept.push(summary);
                }
                Some(_) => discarded += 1,
                None => {
                    let last_contact = self
                        .last_seen
                        .get(robot_id)
                        .copied()
                        .unwrap_or(self.tracking_since);
                    if now - last_contact > self.silence_alert_after {
                        silent_robots.push(robot_id.clone());
                    } else {
                        stale_robots.push(robot_id.clone());
                    }
                }
            }
        }

        if kept.len() < thresholds.min_robot_quorum {
            return AggregationOutcome::InsufficientQuorum {
                reporting: kept.len(),
                required: thresholds.min_robot_quorum,
            };
        }

        let total_samples: u64 = kept.iter().map(|s| s.sample_count).sum();
        let total_errors: u64 = kept.iter().map(|s| s.error_count).sum();
        let total_incidents: u64 = kept.iter().map(|s| s.safety_incidents).sum();
        let weighted_p95: f64 = kept
            .iter()
            .map(|s| s.latency_p95_ms * s.sample_count as f64)
            .sum::<f64>()
            / total_samples as f64;

        let window_start = kept
            .iter()
            .map(|s| s.window_start)
            .min()
            .unwrap_or(now);

        AggregationOutcome::Aggregated(AggregatedDeploymentMetrics {
            window_start,
            window_end: now,
            robots_reporting: kept.len(),
            robots_discarded: discarded,
            stale_robots,
            silent_robots,
            total_samples,
            error_rate: total_errors as f64 / total_samples as f64,
            latency_p95_ms: weighted_p95,
            safety_incident_rate: total_incidents as f64 / total_samples as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::telemetry::RobotMetricsSummary;

    fn thresholds() -> RollbackThresholds {
        RollbackThresholds {
            min_sample_size: 50,
            min_robot_quorum: 2,
            ..RollbackThresholds::default()
        }
    }

    fn robots(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn reduction_is_sample_weighted() {
        let mut aggregator =
            MetricsAggregator::new(Duration::minutes(2), Duration::minutes(10));
        let expected = robots(&["r1", "r2"]);
        // r1 carries 900 of 1000 samples at 1% errors; r2 is a noisy
        // low-volume robot at 10%.
        let summaries = vec![
            RobotMetricsSummary::healthy("r1", 900).with_error_rate(0.01),
            RobotMetricsSummary::healthy("r2", 100).with_error_rate(0.10),
        ];
        let outcome = aggregator.reduce(Utc::now(), &expected, summaries, &thresholds());
        let metrics = match outcome {
            AggregationOutcome::Aggregated(metrics) => metrics,
            other => panic!("expected aggregate, got {other:?}"),
        };
        assert_eq!(metrics.total_samples, 1000);
        assert!((metrics.error_rate - 0.019).abs() < 0.001);
        assert_eq!(metrics.robots_reporting, 2);
    }

    #[test]
    fn low_sample_robots_are_discarded() {
        let mut aggregator =
            MetricsAggregator::new(Duration::minutes(2), Duration::minutes(10));
        let expected = robots(&["r1", "r2", "r3"]);
        let summaries = vec![
            RobotMetricsSummary::healthy("r1", 500),
            RobotMetricsSummary::healthy("r2", 500),
            // Below the 50-sample floor: untrusted, excluded.
            RobotMetricsSummary::healthy("r3", 5).with_error_rate(1.0),
        ];
        let outcome = aggregator.reduce(Utc::now(), &expected, summaries, &thresholds());
        let metrics = match outcome {
            AggregationOutcome::Aggregated(metrics) => metrics,
            other => panic!("expected aggregate, got {other:?}"),
        };
        assert_eq!(metrics.robots_discarded, 1);
        assert_eq!(metrics.error_rate, 0.0);
    }

    #[test]
    fn quorum_failure_skips_the_cycle() {
        let mut aggregator =
            MetricsAggregator::new(Duration::minutes(2), Duration::minutes(10));
        let expected = robots(&["r1", "r2", "r3"]);
        let summaries = vec![RobotMetricsSummary::healthy("r1", 500)];
        let outcome = aggregator.reduce(Utc::now(), &expected, summaries, &thresholds());
        assert_eq!(
            outcome,
            AggregationOutcome::InsufficientQuorum {
                reporting: 1,
                required: 2,
            }
        );
    }

    #[test]
    fn missing_robots_are_flagged_stale_then_silent() {
        let mut aggregator =
            MetricsAggregator::new(Duration::minutes(2), Duration::minutes(10));
        let expected = robots(&["r1", "r2", "r3"]);
        let now = Utc::now();

        // r3 reported once, then goes dark.
        let summaries = vec![
            RobotMetricsSummary::healthy("r1", 500),
            RobotMetricsSummary::healthy("r2", 500),
            RobotMetricsSummary::healthy("r3", 500),
        ];
        aggregator.reduce(now, &expected, summaries, &thresholds());

        let soon = now + Duration::minutes(5);
        let summaries = vec![
            RobotMetricsSummary::healthy("r1", 500).with_reported_at(soon),
            RobotMetricsSummary::healthy("r2", 500).with_reported_at(soon),
        ];
        let outcome = aggregator.reduce(soon, &expected, summaries, &thresholds());
        match outcome {
            AggregationOutcome::Aggregated(metrics) => {
                assert_eq!(metrics.stale_robots, vec!["r3".to_string()]);
                assert!(metrics.silent_robots.is_empty());
            }
            other => panic!("expected aggregate, got {other:?}"),
        }

        let much_later = now + Duration::minutes(30);
        let summaries = vec![
            RobotMetricsSummary::healthy("r1", 500).with_reported_at(much_later),
            RobotMetricsSummary::healthy("r2", 500).with_reported_at(much_later),
        ];
        let outcome = aggregator.reduce(much_later, &expected, summaries, &thresholds());
        match outcome {
            AggregationOutcome::Aggregated(metrics) => {
                assert!(metrics.stale_robots.is_empty());
                assert_eq!(metrics.silent_robots, vec!["r3".to_string()]);
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }
}
