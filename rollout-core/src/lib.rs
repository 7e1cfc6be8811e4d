pub mod config;
pub mod deployment;
pub mod sqlite;

pub use config::{
    load_rollout_config, ConfigError, ConfigResult, FleetSection, MonitoringSection,
    RolloutConfig, ServerSection, StoreSection,
};
pub use deployment::{
    AggregatedDeploymentMetrics, AggregationOutcome, CanaryConfig, CanaryConfigError,
    CanaryStage, Deployment, DeploymentController, DeploymentDetails, DeploymentError,
    DeploymentFilter, DeploymentMetrics, DeploymentPage, DeploymentResult, DeploymentStatus,
    DeploymentStoreBuilder, DeploymentStrategy, FleetError, HttpRobotFleet,
    HttpTelemetryService, MetricsAggregator, MockRobotFleet, MockTelemetryService, ModelVersion,
    MonitorSettings, MonitoredSignal, NewDeployment, NewModelVersion, PushOutcome, RobotFleet,
    RobotMetricsSummary, RollbackEvaluator, RollbackThresholds, RollbackVerdict,
    SqliteDeploymentStore, StoreError, TelemetryError, TelemetryService, ThresholdViolation,
    ViolationSeverity,
};
