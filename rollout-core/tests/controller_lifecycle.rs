use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use rollout_core::{
    CanaryConfig, CanaryStage, DeploymentController, DeploymentError, DeploymentStatus,
    MockRobotFleet, MockTelemetryService, MonitorSettings, NewDeployment, NewModelVersion,
    RollbackThresholds, SqliteDeploymentStore,
};

struct Harness {
    controller: DeploymentController,
    store: SqliteDeploymentStore,
    fleet: Arc<MockRobotFleet>,
    _dir: TempDir,
}

fn harness(robot_count: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = SqliteDeploymentStore::builder()
        .path(dir.path().join("deployments.sqlite"))
        .build()
        .expect("create store");
    store.initialize().expect("initialize store");

    let fleet = Arc::new(MockRobotFleet::with_robots(robot_count));
    let telemetry = Arc::new(MockTelemetryService::new());
    let settings = MonitorSettings {
        interval: Duration::from_millis(25),
        ..MonitorSettings::default()
    };
    let controller =
        DeploymentController::new(store.clone(), fleet.clone(), telemetry, settings);
    Harness {
        controller,
        store,
        fleet,
        _dir: dir,
    }
}

fn register_model(harness: &Harness) -> String {
    harness
        .controller
        .register_model_version(NewModelVersion {
            id: Some("mv-1".into()),
            name: "grasp-policy".into(),
            version: "2.4.0".into(),
            artifact_uri: "s3://models/grasp-policy/2.4.0".into(),
        })
        .expect("register model version")
        .id
}

/// Stages with zero dwell so progression is immediately eligible.
fn instant_config() -> CanaryConfig {
    CanaryConfig::new(
        vec![
            CanaryStage::new(10, 0),
            CanaryStage::new(50, 0),
            CanaryStage::new(100, 0),
        ],
        RollbackThresholds::default(),
    )
}

fn dwell_config() -> CanaryConfig {
    CanaryConfig::new(
        vec![
            CanaryStage::new(10, 5),
            CanaryStage::new(50, 10),
            CanaryStage::new(100, 10),
        ],
        RollbackThresholds::default(),
    )
}

#[tokio::test]
async fn create_requires_a_known_model_version() {
    let harness = harness(10);
    let err = harness
        .controller
        .create(NewDeployment {
            model_version_id: "mv-unknown".into(),
            strategy: None,
            canary_config: None,
            preset: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DeploymentError::Validation(_)));
}

#[tokio::test]
async fn create_accepts_named_presets() {
    let harness = harness(10);
    let model_version_id = register_model(&harness);

    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id: model_version_id.clone(),
            strategy: None,
            canary_config: None,
            preset: Some("conservative".into()),
        })
        .await
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Created);
    assert_eq!(deployment.canary_config, CanaryConfig::conservative());

    let err = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: None,
            preset: Some("bogus".into()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DeploymentError::Config(_)));
}

#[tokio::test]
async fn start_selects_the_first_stage_subset() {
    let harness = harness(20);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(instant_config()),
            preset: None,
        })
        .await
        .unwrap();

    let started = harness.controller.start(deployment.id).await.unwrap();
    assert_eq!(started.status, DeploymentStatus::InProgress);
    assert_eq!(started.traffic_percentage, 10);
    // 10% of 20 robots.
    assert_eq!(started.deployed_robot_ids.len(), 2);
    assert!(started.stage_started_at.is_some());
    assert!(started.started_at.is_some());

    // Starting twice is a state-machine violation.
    let err = harness.controller.start(deployment.id).await.unwrap_err();
    assert!(matches!(err, DeploymentError::InvalidState { .. }));
}

#[tokio::test]
async fn traffic_is_monotonic_across_progressions() {
    let harness = harness(20);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(instant_config()),
            preset: None,
        })
        .await
        .unwrap();
    harness.controller.start(deployment.id).await.unwrap();

    let mut last_traffic = 10;
    let mut last_deployed = 2;
    loop {
        match harness.controller.progress(deployment.id).await {
            Ok(progressed) => {
                assert!(progressed.traffic_percentage >= last_traffic);
                assert!(progressed.deployed_robot_ids.len() >= last_deployed);
                last_traffic = progressed.traffic_percentage;
                last_deployed = progressed.deployed_robot_ids.len();
            }
            Err(DeploymentError::AlreadyAtFinalStage) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(last_traffic, 100);
    assert_eq!(last_deployed, 20);
}

#[tokio::test]
async fn dwell_gate_blocks_early_progress() {
    let harness = harness(20);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(dwell_config()),
            preset: None,
        })
        .await
        .unwrap();
    harness.controller.start(deployment.id).await.unwrap();

    let err = harness.controller.progress(deployment.id).await.unwrap_err();
    assert!(matches!(err, DeploymentError::StageNotElapsed { .. }));

    // State must be untouched by the failed attempt.
    let details = harness.controller.get(deployment.id).await.unwrap();
    assert_eq!(details.deployment.traffic_percentage, 10);
    assert_eq!(details.current_stage, 1);

    // Backdate the stage start past the 5-minute dwell; the gate opens.
    let mut record = harness.store.deployment(deployment.id).unwrap().unwrap();
    record.stage_started_at = Some(Utc::now() - chrono::Duration::minutes(6));
    harness.store.update_deployment(&record).unwrap();

    let progressed = harness.controller.progress(deployment.id).await.unwrap();
    assert_eq!(progressed.traffic_percentage, 50);
}

#[tokio::test]
async fn override_bypasses_the_dwell_gate() {
    let harness = harness(20);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(dwell_config()),
            preset: None,
        })
        .await
        .unwrap();
    harness.controller.start(deployment.id).await.unwrap();

    let progressed = harness
        .controller
        .progress_with_override(deployment.id)
        .await
        .unwrap();
    assert_eq!(progressed.traffic_percentage, 50);
}

#[tokio::test]
async fn promote_requires_full_traffic_and_is_terminal() {
    let harness = harness(10);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(instant_config()),
            preset: None,
        })
        .await
        .unwrap();
    harness.controller.start(deployment.id).await.unwrap();

    let err = harness.controller.promote(deployment.id).await.unwrap_err();
    assert!(matches!(
        err,
        DeploymentError::NotFullyRolledOut { traffic: 10 }
    ));

    harness.controller.progress(deployment.id).await.unwrap();
    harness.controller.progress(deployment.id).await.unwrap();
    let promoted = harness.controller.promote(deployment.id).await.unwrap();
    assert_eq!(promoted.status, DeploymentStatus::Promoted);
    assert!(promoted.completed_at.is_some());

    let metrics = harness.controller.metrics(deployment.id).await.unwrap();
    assert!(!metrics.is_monitoring);
}

#[tokio::test]
async fn terminal_deployments_reject_every_transition() {
    let harness = harness(10);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(instant_config()),
            preset: None,
        })
        .await
        .unwrap();
    harness.controller.start(deployment.id).await.unwrap();
    harness.controller.progress(deployment.id).await.unwrap();
    harness.controller.progress(deployment.id).await.unwrap();
    let promoted = harness.controller.promote(deployment.id).await.unwrap();

    for result in [
        harness.controller.start(deployment.id).await,
        harness.controller.progress(deployment.id).await,
        harness.controller.promote(deployment.id).await,
        harness.controller.rollback(deployment.id, "too late").await,
        harness.controller.cancel(deployment.id).await,
    ] {
        assert!(matches!(
            result.unwrap_err(),
            DeploymentError::InvalidState { .. }
        ));
    }

    let details = harness.controller.get(deployment.id).await.unwrap();
    assert_eq!(details.deployment.status, DeploymentStatus::Promoted);
    assert_eq!(details.deployment.traffic_percentage, promoted.traffic_percentage);
    assert_eq!(
        details.deployment.deployed_robot_ids,
        promoted.deployed_robot_ids
    );
}

#[tokio::test]
async fn rollback_requires_a_reason_and_reverts_traffic() {
    let harness = harness(10);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(instant_config()),
            preset: None,
        })
        .await
        .unwrap();
    harness.controller.start(deployment.id).await.unwrap();

    let err = harness
        .controller
        .rollback(deployment.id, "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, DeploymentError::ReasonRequired));
    let details = harness.controller.get(deployment.id).await.unwrap();
    assert_eq!(details.deployment.status, DeploymentStatus::InProgress);

    let rolled_back = harness
        .controller
        .rollback(deployment.id, "operator observed erratic grasping")
        .await
        .unwrap();
    assert_eq!(rolled_back.status, DeploymentStatus::RolledBack);
    assert_eq!(rolled_back.traffic_percentage, 0);
    assert!(rolled_back.deployed_robot_ids.is_empty());
    assert_eq!(
        rolled_back.rollback_reason.as_deref(),
        Some("operator observed erratic grasping")
    );
}

#[tokio::test]
async fn cancel_reverts_an_in_progress_canary() {
    let harness = harness(10);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(instant_config()),
            preset: None,
        })
        .await
        .unwrap();
    harness.controller.start(deployment.id).await.unwrap();

    let cancelled = harness.controller.cancel(deployment.id).await.unwrap();
    assert_eq!(cancelled.status, DeploymentStatus::Cancelled);
    assert_eq!(cancelled.traffic_percentage, 0);
    assert!(cancelled.deployed_robot_ids.is_empty());
}

#[tokio::test]
async fn partial_push_failures_are_tracked_not_fatal() {
    let harness = harness(4);
    harness.fleet.fail_robot("robot-002");
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(CanaryConfig::new(
                vec![CanaryStage::new(100, 0)],
                RollbackThresholds::default(),
            )),
            preset: None,
        })
        .await
        .unwrap();

    let started = harness.controller.start(deployment.id).await.unwrap();
    assert_eq!(started.status, DeploymentStatus::InProgress);
    assert_eq!(started.deployed_robot_ids.len(), 3);
    assert_eq!(started.failed_robot_ids, vec!["robot-002".to_string()]);
    // Membership sets stay disjoint.
    assert!(!started.deployed_robot_ids.contains(&"robot-002".to_string()));
}

#[tokio::test]
async fn fleet_channel_failure_marks_the_deployment_failed() {
    let harness = harness(4);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(instant_config()),
            preset: None,
        })
        .await
        .unwrap();

    harness.fleet.set_channel_down(true);
    let err = harness.controller.start(deployment.id).await.unwrap_err();
    assert!(matches!(err, DeploymentError::Fleet(_)));

    let record = harness.store.deployment(deployment.id).unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.error_message.is_some());
}

#[tokio::test]
async fn a_robot_belongs_to_at_most_one_active_canary() {
    let harness = harness(10);
    let model_version_id = register_model(&harness);

    let half = CanaryConfig::new(
        vec![CanaryStage::new(50, 0), CanaryStage::new(100, 0)],
        RollbackThresholds::default(),
    );
    let full = CanaryConfig::new(
        vec![CanaryStage::new(100, 0)],
        RollbackThresholds::default(),
    );

    let first = harness
        .controller
        .create(NewDeployment {
            model_version_id: model_version_id.clone(),
            strategy: None,
            canary_config: Some(half),
            preset: None,
        })
        .await
        .unwrap();
    let first = harness.controller.start(first.id).await.unwrap();
    assert_eq!(first.deployed_robot_ids.len(), 5);

    let second = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(full),
            preset: None,
        })
        .await
        .unwrap();
    let second = harness.controller.start(second.id).await.unwrap();
    // Only the robots the first canary has not reserved are available.
    assert_eq!(second.deployed_robot_ids.len(), 5);
    for robot in &second.deployed_robot_ids {
        assert!(!first.deployed_robot_ids.contains(robot));
    }
}

#[tokio::test]
async fn get_exposes_the_derived_read_model() {
    let harness = harness(20);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(dwell_config()),
            preset: None,
        })
        .await
        .unwrap();

    let details = harness.controller.get(deployment.id).await.unwrap();
    assert_eq!(details.current_stage, 0);
    assert_eq!(details.total_stages, 3);
    assert!(details.next_stage_time.is_none());
    assert!(!details.is_monitoring);

    harness.controller.start(deployment.id).await.unwrap();
    let details = harness.controller.get(deployment.id).await.unwrap();
    assert_eq!(details.current_stage, 1);
    assert_eq!(details.deployed_count, 2);
    assert_eq!(details.eligible_robot_count, Some(20));
    assert!(details.next_stage_time.is_some());
    assert!(details.is_monitoring);
    assert_eq!(
        details.model_version.as_ref().map(|mv| mv.id.as_str()),
        Some("mv-1")
    );
}

#[tokio::test]
async fn resume_monitoring_restores_loops_for_in_progress_deployments() {
    let harness = harness(10);
    let model_version_id = register_model(&harness);
    let deployment = harness
        .controller
        .create(NewDeployment {
            model_version_id,
            strategy: None,
            canary_config: Some(instant_config()),
            preset: None,
        })
        .await
        .unwrap();
    harness.controller.start(deployment.id).await.unwrap();

    // A fresh controller over the same store models a process restart.
    let telemetry = Arc::new(MockTelemetryService::new());
    let restarted = DeploymentController::new(
        harness.store.clone(),
        harness.fleet.clone(),
        telemetry,
        MonitorSettings {
            interval: Duration::from_millis(25),
            ..MonitorSettings::default()
        },
    );
    let resumed = restarted.resume_monitoring().await.unwrap();
    assert_eq!(resumed, 1);

    let metrics = restarted.metrics(deployment.id).await.unwrap();
    assert!(metrics.is_monitoring);

    restarted.cancel(deployment.id).await.unwrap();
}
