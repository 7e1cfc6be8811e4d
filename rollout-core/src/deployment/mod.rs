//! Canary deployment subsystem: staged rollout of model versions across
//! a robot fleet with live metrics monitoring and automatic rollback.
//!
//! This module provides:
//! - The deployment aggregate, canary stage schedules, and rollback
//!   thresholds with named presets
//! - The stage progression engine and its dwell-time gate
//! - Fleet-wide weighted aggregation of per-robot metric summaries
//! - Threshold evaluation with consecutive-violation debounce
//! - The robot command channel (eligibility, push, revert)
//! - SQLite persistence for deployments and model versions
//! - The single-writer deployment controller and the per-deployment
//!   background monitoring loop it owns

pub mod aggregate;
pub mod controller;
pub mod evaluator;
pub mod fleet;
pub mod model;
pub mod monitor;
pub mod progression;
pub mod store;
pub mod telemetry;

pub use aggregate::{AggregatedDeploymentMetrics, AggregationOutcome, MetricsAggregator};
pub use controller::{
    DeploymentController, DeploymentDetails, DeploymentError, DeploymentMetrics,
    DeploymentResult, NewDeployment, NewModelVersion,
};
pub use evaluator::{
    EvaluationOutcome, MonitoredSignal, RollbackEvaluator, RollbackVerdict, ThresholdViolation,
    ViolationSeverity,
};
pub use fleet::{
    FleetError, FleetResult, HttpRobotFleet, MockRobotFleet, PushOutcome, RobotFleet,
    RobotPushFailure,
};
pub use model::{
    CanaryConfig, CanaryConfigError, CanaryStage, Deployment, DeploymentStatus,
    DeploymentStrategy, ModelVersion, RollbackThresholds,
};
pub use monitor::{MonitorHandle, MonitorSettings};
pub use store::{
    DeploymentFilter, DeploymentPage, DeploymentStoreBuilder, SqliteDeploymentStore, StoreError,
    StoreResult,
};
pub use telemetry::{
    HttpTelemetryService, MockTelemetryService, RobotMetricsSummary, TelemetryError,
    TelemetryResult, TelemetryService,
};
