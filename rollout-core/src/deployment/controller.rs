use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::aggregate::AggregatedDeploymentMetrics;
use super::fleet::{FleetError, PushOutcome, RobotFleet};
use super::model::{
    CanaryConfig, CanaryConfigError, Deployment, DeploymentStatus, DeploymentStrategy,
    ModelVersion,
};
use super::monitor::{spawn_monitor, MonitorHandle, MonitorSettings};
use super::progression;
use super::store::{DeploymentFilter, DeploymentPage, SqliteDeploymentStore, StoreError};
use super::telemetry::{TelemetryError, TelemetryService};

pub type DeploymentResult<T> = std::result::Result<T, DeploymentError>;

/// Errors surfaced by controller operations. Validation and state errors
/// resolve at the API boundary; store/fleet/telemetry failures are
/// infrastructure errors.
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid canary configuration: {0}")]
    Config(#[from] CanaryConfigError),
    #[error("deployment not found: {0}")]
    NotFound(Uuid),
    #[error("operation '{operation}' is not allowed while deployment is {status}")]
    InvalidState {
        operation: &'static str,
        status: DeploymentStatus,
    },
    #[error("current stage has {remaining_minutes} minute(s) of dwell time remaining")]
    StageNotElapsed { remaining_minutes: i64 },
    #[error("deployment is already at the final stage")]
    AlreadyAtFinalStage,
    #[error("traffic is at {traffic}%, promotion requires 100%")]
    NotFullyRolledOut { traffic: u8 },
    #[error("rollback requires a non-empty reason")]
    ReasonRequired,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("fleet error: {0}")]
    Fleet(#[from] FleetError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
}

/// Request to create a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDeployment {
    pub model_version_id: String,
    pub strategy: Option<DeploymentStrategy>,
    pub canary_config: Option<CanaryConfig>,
    /// Named preset used when no explicit config is supplied.
    pub preset: Option<String>,
}

/// Request to register a model version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewModelVersion {
    pub id: Option<String>,
    pub name: String,
    pub version: String,
    pub artifact_uri: String,
}

/// Read model for a single deployment: the record plus everything the
/// stage engine and monitoring context can derive from it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDetails {
    pub deployment: Deployment,
    pub model_version: Option<ModelVersion>,
    /// 1-based stage ordinal; 0 before the first stage is reached.
    pub current_stage: usize,
    pub total_stages: usize,
    pub next_stage_time: Option<DateTime<Utc>>,
    pub metrics: Option<AggregatedDeploymentMetrics>,
    pub is_monitoring: bool,
    pub eligible_robot_count: Option<usize>,
    pub deployed_count: usize,
    pub failed_count: usize,
}

/// Latest monitoring snapshot for a deployment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMetrics {
    pub deployment_id: Uuid,
    pub metrics: Option<AggregatedDeploymentMetrics>,
    pub is_monitoring: bool,
}

/// In-process state for one deployment: the single-writer lock, the
/// latest aggregate snapshot published by the monitoring loop, and the
/// loop handle itself. Created on demand, destroyed on terminal
/// transition; everything durable lives in the store.
#[derive(Debug, Default)]
pub struct DeploymentContext {
    pub(crate) write_lock: Mutex<()>,
    pub(crate) latest_metrics: RwLock<Option<AggregatedDeploymentMetrics>>,
    pub(crate) monitor: Mutex<Option<MonitorHandle>>,
}

struct ControllerInner {
    store: SqliteDeploymentStore,
    fleet: Arc<dyn RobotFleet>,
    telemetry: Arc<dyn TelemetryService>,
    settings: MonitorSettings,
    contexts: Mutex<HashMap<Uuid, Arc<DeploymentContext>>>,
    /// Robot id -> owning deployment. A robot reserved by one active
    /// canary cannot be selected into another until released.
    reservations: Mutex<HashMap<String, Uuid>>,
}

/// The deployment controller: sole writer of deployment state and owner
/// of the per-deployment monitoring lifecycle.
#[derive(Clone)]
pub struct DeploymentController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for DeploymentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentController")
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl DeploymentController {
    pub fn new(
        store: SqliteDeploymentStore,
        fleet: Arc<dyn RobotFleet>,
        telemetry: Arc<dyn TelemetryService>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                store,
                fleet,
                telemetry,
                settings,
                contexts: Mutex::new(HashMap::new()),
                reservations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn store(&self) -> &SqliteDeploymentStore {
        &self.inner.store
    }

    pub(crate) fn telemetry(&self) -> Arc<dyn TelemetryService> {
        self.inner.telemetry.clone()
    }

    pub(crate) fn settings(&self) -> &MonitorSettings {
        &self.inner.settings
    }

    /// Create a deployment record. The model version must already be
    /// registered; the canary config comes from the request, a named
    /// preset, or the strategy default, and is validated before persisting.
    pub async fn create(&self, request: NewDeployment) -> DeploymentResult<Deployment> {
        if request.model_version_id.trim().is_empty() {
            return Err(DeploymentError::Validation(
                "modelVersionId is required".to_string(),
            ));
        }
        if self
            .inner
            .store
            .model_version(&request.model_version_id)?
            .is_none()
        {
            return Err(DeploymentError::Validation(format!(
                "unknown model version: {}",
                request.model_version_id
            )));
        }

        let strategy = request.strategy.unwrap_or(DeploymentStrategy::Canary);
        let config = match (request.canary_config, request.preset.as_deref()) {
            (Some(config), _) => config,
            (None, Some(preset)) => CanaryConfig::preset(preset)?,
            (None, None) => match strategy {
                DeploymentStrategy::Canary => CanaryConfig::default(),
                DeploymentStrategy::Immediate => CanaryConfig::immediate(),
            },
        };
        config.validate()?;

        let deployment = Deployment::new(request.model_version_id, strategy, config);
        self.inner.store.insert_deployment(&deployment)?;
        tracing::info!(
            target: "deployment_controller",
            deployment_id = %deployment.id,
            model_version_id = %deployment.model_version_id,
            strategy = %deployment.strategy,
            "deployment created"
        );
        Ok(deployment)
    }

    /// Start the rollout: push the model version to the first-stage robot
    /// subset and spawn the monitoring loop.
    pub async fn start(&self, id: Uuid) -> DeploymentResult<Deployment> {
        let ctx = self.context_for(id, "start").await?;
        let _guard = ctx.write_lock.lock().await;

        let mut deployment = self.fetch_required(id)?;
        if deployment.status != DeploymentStatus::Created {
            return Err(DeploymentError::InvalidState {
                operation: "start",
                status: deployment.status,
            });
        }
        if self
            .inner
            .store
            .model_version(&deployment.model_version_id)?
            .is_none()
        {
            return Err(DeploymentError::Validation(format!(
                "model version {} no longer resolves",
                deployment.model_version_id
            )));
        }

        deployment.status = DeploymentStatus::Starting;
        deployment.started_at = Some(Utc::now());
        self.inner.store.update_deployment(&deployment)?;

        let first_stage_percentage = deployment.canary_config.stages[0].percentage;
        let eligible = match self.inner.fleet.eligible_robots().await {
            Ok(robots) => robots,
            Err(err) => {
                self.fail_deployment(&mut deployment, format!("fleet lookup failed: {err}"))
                    .await?;
                return Err(err.into());
            }
        };

        let selection = self
            .select_additional_robots(&deployment, &eligible, first_stage_percentage)
            .await;
        self.reserve_robots(id, &selection).await;

        let outcome = match self
            .inner
            .fleet
            .push_model_version(&selection, &deployment.model_version_id)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail_deployment(&mut deployment, format!("fleet push failed: {err}"))
                    .await?;
                return Err(err.into());
            }
        };
        self.apply_push_outcome(&mut deployment, outcome).await;

        let now = Utc::now();
        deployment.traffic_percentage = first_stage_percentage;
        deployment.stage_started_at = Some(now);
        deployment.status = DeploymentStatus::InProgress;
        self.inner.store.update_deployment(&deployment)?;

        let handle = spawn_monitor(self.clone(), id, ctx.clone());
        *ctx.monitor.lock().await = Some(handle);

        tracing::info!(
            target: "deployment_controller",
            deployment_id = %id,
            traffic = deployment.traffic_percentage,
            deployed = deployment.deployed_robot_ids.len(),
            failed = deployment.failed_robot_ids.len(),
            "deployment started"
        );
        Ok(deployment)
    }

    /// Advance to the next stage once the dwell-time gate has opened.
    pub async fn progress(&self, id: Uuid) -> DeploymentResult<Deployment> {
        self.progress_inner(id, false, "progress").await
    }

    /// Operator override of the dwell-time gate. Distinct operation so
    /// the override is visible in the logs.
    pub async fn progress_with_override(&self, id: Uuid) -> DeploymentResult<Deployment> {
        self.progress_inner(id, true, "progress_with_override").await
    }

    async fn progress_inner(
        &self,
        id: Uuid,
        override_dwell: bool,
        operation: &'static str,
    ) -> DeploymentResult<Deployment> {
        let ctx = self.context_for(id, operation).await?;
        let _guard = ctx.write_lock.lock().await;

        let mut deployment = self.fetch_required(id)?;
        if deployment.status != DeploymentStatus::InProgress {
            return Err(DeploymentError::InvalidState {
                operation,
                status: deployment.status,
            });
        }

        let stages = deployment.canary_config.stages.clone();
        let next = progression::next_stage(deployment.traffic_percentage, &stages)
            .copied()
            .ok_or(DeploymentError::AlreadyAtFinalStage)?;

        if !override_dwell {
            if let (Some(stage), Some(started)) = (
                progression::current_stage(deployment.traffic_percentage, &stages),
                deployment.stage_started_at,
            ) {
                let now = Utc::now();
                if !progression::dwell_elapsed(now, started, stage) {
                    let remaining = progression::dwell_remaining(now, started, stage);
                    return Err(DeploymentError::StageNotElapsed {
                        remaining_minutes: (remaining.num_seconds() + 59) / 60,
                    });
                }
            }
        } else {
            tracing::warn!(
                target: "deployment_controller",
                deployment_id = %id,
                traffic = deployment.traffic_percentage,
                "dwell-time gate overridden by operator"
            );
        }

        let eligible = match self.inner.fleet.eligible_robots().await {
            Ok(robots) => robots,
            Err(err) => {
                self.fail_deployment(&mut deployment, format!("fleet lookup failed: {err}"))
                    .await?;
                return Err(err.into());
            }
        };
        let selection = self
            .select_additional_robots(&deployment, &eligible, next.percentage)
            .await;
        self.reserve_robots(id, &selection).await;

        if !selection.is_empty() {
            let outcome = match self
                .inner
                .fleet
                .push_model_version(&selection, &deployment.model_version_id)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.fail_deployment(&mut deployment, format!("fleet push failed: {err}"))
                        .await?;
                    return Err(err.into());
                }
            };
            self.apply_push_outcome(&mut deployment, outcome).await;
        }

        deployment.traffic_percentage = next.percentage;
        deployment.stage_started_at = Some(Utc::now());
        self.inner.store.update_deployment(&deployment)?;

        tracing::info!(
            target: "deployment_controller",
            deployment_id = %id,
            traffic = deployment.traffic_percentage,
            deployed = deployment.deployed_robot_ids.len(),
            "deployment progressed"
        );
        Ok(deployment)
    }

    /// Promote the deployment to full production. Requires 100% traffic;
    /// terminal; stops the monitoring loop.
    pub async fn promote(&self, id: Uuid) -> DeploymentResult<Deployment> {
        let ctx = self.context_for(id, "promote").await?;
        let _guard = ctx.write_lock.lock().await;

        let mut deployment = self.fetch_required(id)?;
        if deployment.status != DeploymentStatus::InProgress {
            return Err(DeploymentError::InvalidState {
                operation: "promote",
                status: deployment.status,
            });
        }
        if deployment.traffic_percentage != 100 {
            return Err(DeploymentError::NotFullyRolledOut {
                traffic: deployment.traffic_percentage,
            });
        }

        deployment.status = DeploymentStatus::Promoting;
        self.inner.store.update_deployment(&deployment)?;

        deployment.status = DeploymentStatus::Promoted;
        deployment.completed_at = Some(Utc::now());
        self.inner.store.update_deployment(&deployment)?;
        self.finish_terminal(&deployment).await;

        tracing::info!(
            target: "deployment_controller",
            deployment_id = %id,
            "deployment promoted"
        );
        Ok(deployment)
    }

    /// Roll the canary back: revert all canary robots to the prior
    /// version. Legal from starting, in-progress, and promoting states;
    /// requires a reason (operator-supplied or evaluator-generated).
    pub async fn rollback(&self, id: Uuid, reason: &str) -> DeploymentResult<Deployment> {
        if reason.trim().is_empty() {
            return Err(DeploymentError::ReasonRequired);
        }
        let ctx = self.context_for(id, "rollback").await?;
        let _guard = ctx.write_lock.lock().await;

        let mut deployment = self.fetch_required(id)?;
        if !matches!(
            deployment.status,
            DeploymentStatus::Starting
                | DeploymentStatus::InProgress
                | DeploymentStatus::Promoting
        ) {
            return Err(DeploymentError::InvalidState {
                operation: "rollback",
                status: deployment.status,
            });
        }

        deployment.status = DeploymentStatus::RollingBack;
        deployment.rollback_reason = Some(reason.trim().to_string());
        self.inner.store.update_deployment(&deployment)?;

        if !deployment.deployed_robot_ids.is_empty() {
            if let Err(err) = self.revert_robots(&mut deployment).await {
                self.fail_deployment(&mut deployment, format!("rollback revert failed: {err}"))
                    .await?;
                return Err(err.into());
            }
        }

        deployment.deployed_robot_ids.clear();
        deployment.traffic_percentage = 0;
        deployment.status = DeploymentStatus::RolledBack;
        deployment.completed_at = Some(Utc::now());
        self.inner.store.update_deployment(&deployment)?;
        self.finish_terminal(&deployment).await;

        tracing::info!(
            target: "deployment_controller",
            deployment_id = %id,
            reason = %reason.trim(),
            "deployment rolled back"
        );
        Ok(deployment)
    }

    /// Cancel before promotion. Reverts any canary robots and stops the
    /// monitoring loop if one is running.
    pub async fn cancel(&self, id: Uuid) -> DeploymentResult<Deployment> {
        let ctx = self.context_for(id, "cancel").await?;
        let _guard = ctx.write_lock.lock().await;

        let mut deployment = self.fetch_required(id)?;
        if !matches!(
            deployment.status,
            DeploymentStatus::Created | DeploymentStatus::InProgress
        ) {
            return Err(DeploymentError::InvalidState {
                operation: "cancel",
                status: deployment.status,
            });
        }

        if !deployment.deployed_robot_ids.is_empty() {
            if let Err(err) = self.revert_robots(&mut deployment).await {
                self.fail_deployment(&mut deployment, format!("cancel revert failed: {err}"))
                    .await?;
                return Err(err.into());
            }
        }

        deployment.deployed_robot_ids.clear();
        deployment.traffic_percentage = 0;
        deployment.status = DeploymentStatus::Cancelled;
        deployment.completed_at = Some(Utc::now());
        self.inner.store.update_deployment(&deployment)?;
        self.finish_terminal(&deployment).await;

        tracing::info!(
            target: "deployment_controller",
            deployment_id = %id,
            "deployment cancelled"
        );
        Ok(deployment)
    }

    /// Full read model for one deployment.
    pub async fn get(&self, id: Uuid) -> DeploymentResult<DeploymentDetails> {
        let deployment = self.fetch_required(id)?;
        let model_version = self.inner.store.model_version(&deployment.model_version_id)?;
        let stages = &deployment.canary_config.stages;

        let current_stage =
            progression::current_stage_index(deployment.traffic_percentage, stages).unwrap_or(0);
        let next_stage_time = if deployment.status == DeploymentStatus::InProgress {
            match (
                progression::current_stage(deployment.traffic_percentage, stages),
                progression::next_stage(deployment.traffic_percentage, stages),
                deployment.stage_started_at,
            ) {
                (Some(stage), Some(_), Some(started)) => {
                    Some(progression::next_eligible_time(started, stage))
                }
                _ => None,
            }
        } else {
            None
        };

        let (metrics, is_monitoring) = self.monitoring_snapshot(id).await;
        let eligible_robot_count = match self.inner.fleet.eligible_robots().await {
            Ok(robots) => Some(robots.len()),
            Err(err) => {
                tracing::warn!(
                    target: "deployment_controller",
                    deployment_id = %id,
                    error = %err,
                    "eligible robot lookup failed"
                );
                None
            }
        };

        Ok(DeploymentDetails {
            deployed_count: deployment.deployed_robot_ids.len(),
            failed_count: deployment.failed_robot_ids.len(),
            total_stages: stages.len(),
            current_stage,
            next_stage_time,
            metrics,
            is_monitoring,
            eligible_robot_count,
            model_version,
            deployment,
        })
    }

    /// Latest aggregate snapshot and monitoring state for a deployment.
    pub async fn metrics(&self, id: Uuid) -> DeploymentResult<DeploymentMetrics> {
        self.fetch_required(id)?;
        let (metrics, is_monitoring) = self.monitoring_snapshot(id).await;
        Ok(DeploymentMetrics {
            deployment_id: id,
            metrics,
            is_monitoring,
        })
    }

    pub fn list(&self, filter: &DeploymentFilter) -> DeploymentResult<DeploymentPage> {
        Ok(self.inner.store.list_deployments(filter)?)
    }

    pub fn active(&self) -> DeploymentResult<Vec<Deployment>> {
        Ok(self.inner.store.active_deployments()?)
    }

    pub fn register_model_version(
        &self,
        request: NewModelVersion,
    ) -> DeploymentResult<ModelVersion> {
        for (field, value) in [
            ("name", &request.name),
            ("version", &request.version),
            ("artifactUri", &request.artifact_uri),
        ] {
            if value.trim().is_empty() {
                return Err(DeploymentError::Validation(format!("{field} is required")));
            }
        }
        let id = request
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.inner.store.model_version(&id)?.is_some() {
            return Err(DeploymentError::Validation(format!(
                "model version {id} already exists"
            )));
        }
        let model_version = ModelVersion {
            id,
            name: request.name,
            version: request.version,
            artifact_uri: request.artifact_uri,
            created_at: Utc::now(),
        };
        self.inner.store.insert_model_version(&model_version)?;
        Ok(model_version)
    }

    pub fn model_versions(&self) -> DeploymentResult<Vec<ModelVersion>> {
        Ok(self.inner.store.list_model_versions()?)
    }

    /// Rebuild in-process state after a restart: re-reserve the robots of
    /// every active deployment and respawn monitoring loops for the
    /// in-progress ones. Dwell timing survives because `stage_started_at`
    /// is persisted.
    pub async fn resume_monitoring(&self) -> DeploymentResult<usize> {
        let mut resumed = 0usize;
        for deployment in self.inner.store.active_deployments()? {
            self.reserve_robots(deployment.id, &deployment.deployed_robot_ids)
                .await;
            match deployment.status {
                DeploymentStatus::InProgress => {
                    let ctx = self.context(deployment.id).await;
                    let mut monitor = ctx.monitor.lock().await;
                    if monitor.is_none() {
                        *monitor = Some(spawn_monitor(self.clone(), deployment.id, ctx.clone()));
                        resumed += 1;
                    }
                }
                status => {
                    tracing::warn!(
                        target: "deployment_controller",
                        deployment_id = %deployment.id,
                        status = %status,
                        "deployment was mid-transition at shutdown; operator action required"
                    );
                }
            }
        }
        if resumed > 0 {
            tracing::info!(
                target: "deployment_controller",
                count = resumed,
                "monitoring loops resumed"
            );
        }
        Ok(resumed)
    }

    async fn context(&self, id: Uuid) -> Arc<DeploymentContext> {
        let mut contexts = self.inner.contexts.lock().await;
        contexts
            .entry(id)
            .or_insert_with(|| Arc::new(DeploymentContext::default()))
            .clone()
    }

    /// Context lookup for a mutating operation. Terminal deployments are
    /// rejected up front so they never accrete contexts; the check is
    /// repeated authoritatively once the write lock is held.
    async fn context_for(
        &self,
        id: Uuid,
        operation: &'static str,
    ) -> DeploymentResult<Arc<DeploymentContext>> {
        let record = self.fetch_required(id)?;
        if record.status.is_terminal() {
            return Err(DeploymentError::InvalidState {
                operation,
                status: record.status,
            });
        }
        Ok(self.context(id).await)
    }

    async fn monitoring_snapshot(
        &self,
        id: Uuid,
    ) -> (Option<AggregatedDeploymentMetrics>, bool) {
        let ctx = self.inner.contexts.lock().await.get(&id).cloned();
        match ctx {
            Some(ctx) => {
                let metrics = ctx.latest_metrics.read().await.clone();
                let is_monitoring = ctx
                    .monitor
                    .lock()
                    .await
                    .as_ref()
                    .map(|handle| !handle.is_finished())
                    .unwrap_or(false);
                (metrics, is_monitoring)
            }
            None => (None, false),
        }
    }

    fn fetch_required(&self, id: Uuid) -> DeploymentResult<Deployment> {
        self.inner
            .store
            .deployment(id)?
            .ok_or(DeploymentError::NotFound(id))
    }

    /// Pick additional robots to reach the target percentage of the
    /// eligible fleet. Robots already in this deployment, robots that
    /// already failed it, and robots reserved by other deployments are
    /// excluded.
    async fn select_additional_robots(
        &self,
        deployment: &Deployment,
        eligible: &[String],
        target_percentage: u8,
    ) -> Vec<String> {
        let target = (eligible.len() * usize::from(target_percentage) + 99) / 100;
        let additional = target.saturating_sub(deployment.deployed_robot_ids.len());
        if additional == 0 {
            return Vec::new();
        }

        let excluded: HashSet<&String> = deployment
            .deployed_robot_ids
            .iter()
            .chain(deployment.failed_robot_ids.iter())
            .collect();
        let reservations = self.inner.reservations.lock().await;
        let mut candidates: Vec<String> = eligible
            .iter()
            .filter(|robot| !excluded.contains(*robot))
            .filter(|robot| match reservations.get(*robot) {
                Some(owner) => *owner == deployment.id,
                None => true,
            })
            .cloned()
            .collect();
        drop(reservations);

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(additional);
        candidates
    }

    async fn reserve_robots(&self, id: Uuid, robots: &[String]) {
        let mut reservations = self.inner.reservations.lock().await;
        for robot in robots {
            reservations.insert(robot.clone(), id);
        }
    }

    async fn apply_push_outcome(&self, deployment: &mut Deployment, outcome: PushOutcome) {
        deployment.deployed_robot_ids.extend(outcome.succeeded);
        if !outcome.failed.is_empty() {
            let mut reservations = self.inner.reservations.lock().await;
            for failure in &outcome.failed {
                tracing::warn!(
                    target: "deployment_controller",
                    deployment_id = %deployment.id,
                    robot_id = %failure.robot_id,
                    error = %failure.error,
                    "robot rejected model push"
                );
                reservations.remove(&failure.robot_id);
                if !deployment.failed_robot_ids.contains(&failure.robot_id) {
                    deployment.failed_robot_ids.push(failure.robot_id.clone());
                }
            }
        }
    }

    async fn revert_robots(&self, deployment: &mut Deployment) -> Result<(), FleetError> {
        let outcome = self
            .inner
            .fleet
            .revert_model_version(&deployment.deployed_robot_ids)
            .await?;
        for failure in &outcome.failed {
            tracing::warn!(
                target: "deployment_controller",
                deployment_id = %deployment.id,
                robot_id = %failure.robot_id,
                error = %failure.error,
                "robot failed to revert"
            );
            if !deployment.failed_robot_ids.contains(&failure.robot_id) {
                deployment.failed_robot_ids.push(failure.robot_id.clone());
            }
        }
        Ok(())
    }

    /// Unrecoverable infrastructure failure: freeze the record as failed
    /// with the message preserved so callers can inspect it afterwards.
    async fn fail_deployment(
        &self,
        deployment: &mut Deployment,
        message: String,
    ) -> DeploymentResult<()> {
        tracing::error!(
            target: "deployment_controller",
            deployment_id = %deployment.id,
            error = %message,
            "deployment failed"
        );
        deployment.status = DeploymentStatus::Failed;
        deployment.error_message = Some(message);
        deployment.completed_at = Some(Utc::now());
        self.inner.store.update_deployment(deployment)?;
        self.finish_terminal(deployment).await;
        Ok(())
    }

    /// Tear down per-deployment runtime state on any terminal transition:
    /// stop the monitoring loop (idempotent) and release robot
    /// reservations. Safe to call when no loop was ever started.
    async fn finish_terminal(&self, deployment: &Deployment) {
        let ctx = self.inner.contexts.lock().await.remove(&deployment.id);
        if let Some(ctx) = ctx {
            if let Some(handle) = ctx.monitor.lock().await.take() {
                handle.stop();
            }
        }
        let mut reservations = self.inner.reservations.lock().await;
        reservations.retain(|_, owner| *owner != deployment.id);
    }
}
