//! Per-deployment monitoring loop: on a fixed cadence, pull robot
//! summaries, reduce them into a fleet aggregate, evaluate rollback
//! thresholds, and on a verdict call back into the controller exactly
//! once. Telemetry I/O happens outside the deployment's write lock; the
//! lock is only taken (inside `Controller::rollback`) to apply a verdict.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::config::MonitoringSection;

use super::aggregate::{AggregationOutcome, MetricsAggregator};
use super::controller::{DeploymentContext, DeploymentController};
use super::evaluator::RollbackEvaluator;
use super::model::DeploymentStatus;

/// Cadence and staleness windows for monitoring loops.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Trailing telemetry window requested each cycle.
    pub window: chrono::Duration,
    /// A robot whose last report is older than this is dropped from the
    /// cycle and flagged stale.
    pub stale_after: chrono::Duration,
    /// Silence beyond this is surfaced as its own operator signal.
    pub silence_alert_after: chrono::Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(45),
            window: chrono::Duration::seconds(300),
            stale_after: chrono::Duration::seconds(120),
            silence_alert_after: chrono::Duration::seconds(600),
        }
    }
}

impl From<&MonitoringSection> for MonitorSettings {
    fn from(section: &MonitoringSection) -> Self {
        Self {
            interval: section.interval(),
            window: section.window(),
            stale_after: section.stale_after(),
            silence_alert_after: section.silence_alert_after(),
        }
    }
}

/// Handle to a running monitoring loop. Stopping is idempotent: the stop
/// signal is a watch channel, and sending it twice is a no-op.
#[derive(Debug)]
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop task to exit. Test helper; production callers
    /// only signal and move on.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

/// Spawn the monitoring loop for one deployment. The loop owns its
/// aggregator and evaluator state and terminates itself on a terminal
/// deployment status, a stop signal, or after handing a rollback verdict
/// to the controller.
pub(crate) fn spawn_monitor(
    controller: DeploymentController,
    deployment_id: Uuid,
    ctx: Arc<DeploymentContext>,
) -> MonitorHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let settings = controller.settings().clone();

    let task = tokio::spawn(async move {
        let mut aggregator =
            MetricsAggregator::new(settings.stale_after, settings.silence_alert_after);
        let mut evaluator: Option<RollbackEvaluator> = None;
        let mut ticker = interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            target: "deployment_monitor",
            deployment_id = %deployment_id,
            interval_s = settings.interval.as_secs(),
            "monitoring loop started"
        );

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            let deployment = match controller.store().deployment(deployment_id) {
                Ok(Some(deployment)) => deployment,
                Ok(None) => {
                    tracing::warn!(
                        target: "deployment_monitor",
                        deployment_id = %deployment_id,
                        "deployment record disappeared; stopping loop"
                    );
                    break;
                }
                Err(err) => {
                    // Transient store failure: retry next cycle.
                    tracing::warn!(
                        target: "deployment_monitor",
                        deployment_id = %deployment_id,
                        error = %err,
                        "deployment fetch failed"
                    );
                    continue;
                }
            };

            if deployment.status != DeploymentStatus::InProgress {
                tracing::debug!(
                    target: "deployment_monitor",
                    deployment_id = %deployment_id,
                    status = %deployment.status,
                    "deployment left in-progress state; stopping loop"
                );
                break;
            }
            if deployment.deployed_robot_ids.is_empty() {
                continue;
            }

            let thresholds = deployment.canary_config.rollback_thresholds.clone();
            let evaluator =
                evaluator.get_or_insert_with(|| RollbackEvaluator::new(thresholds.clone()));

            let summaries = match controller
                .telemetry()
                .robot_summaries(&deployment.deployed_robot_ids, settings.window)
                .await
            {
                Ok(summaries) => summaries,
                Err(err) => {
                    // A single bad sample never halts monitoring.
                    tracing::warn!(
                        target: "deployment_monitor",
                        deployment_id = %deployment_id,
                        error = %err,
                        "telemetry fetch failed; retrying next cycle"
                    );
                    continue;
                }
            };

            let metrics = match aggregator.reduce(
                Utc::now(),
                &deployment.deployed_robot_ids,
                summaries,
                &thresholds,
            ) {
                AggregationOutcome::Aggregated(metrics) => metrics,
                AggregationOutcome::InsufficientQuorum {
                    reporting,
                    required,
                } => {
                    tracing::debug!(
                        target: "deployment_monitor",
                        deployment_id = %deployment_id,
                        reporting,
                        required,
                        "below robot quorum; cycle skipped"
                    );
                    continue;
                }
            };

            if !metrics.silent_robots.is_empty() {
                tracing::warn!(
                    target: "deployment_monitor",
                    deployment_id = %deployment_id,
                    robots = ?metrics.silent_robots,
                    "robots silent beyond alert window"
                );
            }

            *ctx.latest_metrics.write().await = Some(metrics.clone());

            let outcome = evaluator.evaluate(&metrics);
            for violation in &outcome.violations {
                tracing::warn!(
                    target: "deployment_monitor",
                    deployment_id = %deployment_id,
                    metric = %violation.metric,
                    observed = violation.observed_value,
                    threshold = violation.threshold_value,
                    severity = ?violation.severity,
                    "rollback threshold violated"
                );
            }

            if let Some(verdict) = outcome.verdict {
                tracing::info!(
                    target: "deployment_monitor",
                    deployment_id = %deployment_id,
                    metric = %verdict.signal,
                    consecutive_cycles = verdict.consecutive_cycles,
                    "rollback verdict reached"
                );
                if let Err(err) = controller.rollback(deployment_id, &verdict.reason).await {
                    // An operator transition may have raced us; the state
                    // machine already resolved it either way.
                    tracing::warn!(
                        target: "deployment_monitor",
                        deployment_id = %deployment_id,
                        error = %err,
                        "automatic rollback was not applied"
                    );
                }
                break;
            }
        }

        tracing::debug!(
            target: "deployment_monitor",
            deployment_id = %deployment_id,
            "monitoring loop stopped"
        );
    });

    MonitorHandle { stop_tx, task }
}
