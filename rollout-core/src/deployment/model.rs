use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while validating a canary configuration.
#[derive(Debug, Error)]
pub enum CanaryConfigError {
    #[error("stage list must not be empty")]
    EmptyStages,
    #[error("stage percentage {0} outside range 1..=100")]
    PercentageOutOfRange(u8),
    #[error("stage percentages must be strictly ascending (offending stage {index})")]
    NonAscendingStages { index: usize },
    #[error("final stage must reach 100%, got {0}")]
    FinalStageNotFull(u8),
    #[error("threshold {name} must be positive, got {value}")]
    NonPositiveThreshold { name: &'static str, value: f64 },
    #[error("consecutive_violations_to_trigger must be at least 1")]
    ZeroViolationTrigger,
    #[error("minimum robot quorum must be at least 1")]
    ZeroQuorum,
    #[error("unknown canary preset: {0}")]
    UnknownPreset(String),
}

/// One checkpoint of a staged rollout: a traffic percentage and the
/// minimum dwell time before further progression is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStage {
    pub percentage: u8,
    pub duration_minutes: u32,
}

impl CanaryStage {
    pub fn new(percentage: u8, duration_minutes: u32) -> Self {
        Self {
            percentage,
            duration_minutes,
        }
    }
}

/// Ceilings on fleet-wide operational signals beyond which a rollout is
/// considered unsafe, plus the evidence floors that gate when a signal is
/// trusted at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackThresholds {
    /// Maximum acceptable fleet-wide error rate (errors / samples).
    pub max_error_rate: f64,
    /// Maximum acceptable weighted P95 command latency in milliseconds.
    pub max_latency_p95_ms: f64,
    /// Maximum acceptable safety incidents per command sample.
    pub max_safety_incident_rate: f64,
    /// Per-robot sample floor below which a summary is discarded.
    pub min_sample_size: u64,
    /// Minimum robots with trusted summaries for a cycle to produce a verdict.
    pub min_robot_quorum: usize,
    /// Consecutive breaching cycles required before an automatic rollback.
    pub consecutive_violations_to_trigger: u32,
}

impl Default for RollbackThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            max_latency_p95_ms: 800.0,
            max_safety_incident_rate: 0.01,
            min_sample_size: 50,
            min_robot_quorum: 3,
            consecutive_violations_to_trigger: 3,
        }
    }
}

/// Full canary rollout policy for one deployment: the staged traffic
/// schedule and the rollback guardrails watching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryConfig {
    pub stages: Vec<CanaryStage>,
    pub rollback_thresholds: RollbackThresholds,
}

impl CanaryConfig {
    pub fn new(stages: Vec<CanaryStage>, rollback_thresholds: RollbackThresholds) -> Self {
        Self {
            stages,
            rollback_thresholds,
        }
    }

    /// Slow, wide ramp with long dwell times and a hair-trigger debounce.
    pub fn conservative() -> Self {
        Self {
            stages: vec![
                CanaryStage::new(5, 30),
                CanaryStage::new(15, 60),
                CanaryStage::new(40, 120),
                CanaryStage::new(70, 180),
                CanaryStage::new(100, 240),
            ],
            rollback_thresholds: RollbackThresholds {
                max_error_rate: 0.03,
                max_latency_p95_ms: 600.0,
                max_safety_incident_rate: 0.005,
                consecutive_violations_to_trigger: 2,
                ..RollbackThresholds::default()
            },
        }
    }

    /// Default ramp: four stages over a working day.
    pub fn balanced() -> Self {
        Self {
            stages: vec![
                CanaryStage::new(10, 15),
                CanaryStage::new(25, 30),
                CanaryStage::new(50, 60),
                CanaryStage::new(100, 120),
            ],
            rollback_thresholds: RollbackThresholds::default(),
        }
    }

    /// Fast ramp for low-risk updates.
    pub fn aggressive() -> Self {
        Self {
            stages: vec![
                CanaryStage::new(20, 5),
                CanaryStage::new(50, 10),
                CanaryStage::new(100, 15),
            ],
            rollback_thresholds: RollbackThresholds {
                max_error_rate: 0.08,
                max_latency_p95_ms: 1000.0,
                ..RollbackThresholds::default()
            },
        }
    }

    /// Degenerate single-stage schedule used by the immediate strategy.
    pub fn immediate() -> Self {
        Self {
            stages: vec![CanaryStage::new(100, 0)],
            rollback_thresholds: RollbackThresholds::default(),
        }
    }

    pub fn preset(name: &str) -> Result<Self, CanaryConfigError> {
        match name {
            "conservative" => Ok(Self::conservative()),
            "balanced" => Ok(Self::balanced()),
            "aggressive" => Ok(Self::aggressive()),
            other => Err(CanaryConfigError::UnknownPreset(other.to_string())),
        }
    }

    /// Enforce the structural invariants every stored config must satisfy:
    /// non-empty, strictly ascending percentages, final stage at 100%,
    /// positive thresholds.
    pub fn validate(&self) -> Result<(), CanaryConfigError> {
        if self.stages.is_empty() {
            return Err(CanaryConfigError::EmptyStages);
        }
        let mut previous: Option<u8> = None;
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.percentage == 0 || stage.percentage > 100 {
                return Err(CanaryConfigError::PercentageOutOfRange(stage.percentage));
            }
            if let Some(prev) = previous {
                if stage.percentage <= prev {
                    return Err(CanaryConfigError::NonAscendingStages { index });
                }
            }
            previous = Some(stage.percentage);
        }
        let last = self.stages.last().map(|s| s.percentage).unwrap_or(0);
        if last != 100 {
            return Err(CanaryConfigError::FinalStageNotFull(last));
        }

        let thresholds = &self.rollback_thresholds;
        for (name, value) in [
            ("max_error_rate", thresholds.max_error_rate),
            ("max_latency_p95_ms", thresholds.max_latency_p95_ms),
            (
                "max_safety_incident_rate",
                thresholds.max_safety_incident_rate,
            ),
        ] {
            if value <= 0.0 {
                return Err(CanaryConfigError::NonPositiveThreshold { name, value });
            }
        }
        if thresholds.consecutive_violations_to_trigger == 0 {
            return Err(CanaryConfigError::ZeroViolationTrigger);
        }
        if thresholds.min_robot_quorum == 0 {
            return Err(CanaryConfigError::ZeroQuorum);
        }
        Ok(())
    }
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Rollout strategy requested at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    Canary,
    Immediate,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategy::Canary => "canary",
            DeploymentStrategy::Immediate => "immediate",
        }
    }
}

impl std::fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "canary" => Ok(DeploymentStrategy::Canary),
            "immediate" => Ok(DeploymentStrategy::Immediate),
            other => Err(format!("unknown deployment strategy: {other}")),
        }
    }
}

/// Lifecycle state of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Created,
    Starting,
    InProgress,
    Promoting,
    Promoted,
    RollingBack,
    RolledBack,
    Cancelled,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Created => "created",
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Promoting => "promoting",
            DeploymentStatus::Promoted => "promoted",
            DeploymentStatus::RollingBack => "rolling_back",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Cancelled => "cancelled",
            DeploymentStatus::Failed => "failed",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Promoted
                | DeploymentStatus::RolledBack
                | DeploymentStatus::Cancelled
                | DeploymentStatus::Failed
        )
    }

    /// States in which fleet traffic is (or is being) shifted.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Starting
                | DeploymentStatus::InProgress
                | DeploymentStatus::Promoting
                | DeploymentStatus::RollingBack
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" => Ok(DeploymentStatus::Created),
            "starting" => Ok(DeploymentStatus::Starting),
            "in_progress" => Ok(DeploymentStatus::InProgress),
            "promoting" => Ok(DeploymentStatus::Promoting),
            "promoted" => Ok(DeploymentStatus::Promoted),
            "rolling_back" => Ok(DeploymentStatus::RollingBack),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            "cancelled" => Ok(DeploymentStatus::Cancelled),
            "failed" => Ok(DeploymentStatus::Failed),
            other => Err(format!("unknown deployment status: {other}")),
        }
    }
}

/// Immutable reference to a trained model artifact, registered out of band
/// and only ever looked up by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub id: String,
    pub name: String,
    pub version: String,
    pub artifact_uri: String,
    pub created_at: DateTime<Utc>,
}

/// The deployment aggregate root. Mutated exclusively by the controller
/// and by the monitoring loop's rollback callback; terminal states freeze
/// everything but audit metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: Uuid,
    pub model_version_id: String,
    pub strategy: DeploymentStrategy,
    pub canary_config: CanaryConfig,
    pub status: DeploymentStatus,
    /// Always equal to some stage's percentage while in progress; 0 after
    /// rollback or cancellation.
    pub traffic_percentage: u8,
    /// Robots confirmed running the canary version. Disjoint from
    /// `failed_robot_ids`.
    pub deployed_robot_ids: Vec<String>,
    /// Robots that failed to receive or accept the update.
    pub failed_robot_ids: Vec<String>,
    /// When the current stage began; drives the dwell-time gate and is
    /// persisted so timing survives a process restart.
    pub stage_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rollback_reason: Option<String>,
    pub error_message: Option<String>,
}

impl Deployment {
    pub fn new(
        model_version_id: impl Into<String>,
        strategy: DeploymentStrategy,
        canary_config: CanaryConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_version_id: model_version_id.into(),
            strategy,
            canary_config,
            status: DeploymentStatus::Created,
            traffic_percentage: 0,
            deployed_robot_ids: Vec::new(),
            failed_robot_ids: Vec::new(),
            stage_started_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            rollback_reason: None,
            error_message: None,
        }
    }
}
