use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type FleetResult<T> = std::result::Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("fleet request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("fleet gateway returned status {status}: {message}")]
    Endpoint { status: u16, message: String },
}

/// One robot that failed to receive or accept a version push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotPushFailure {
    pub robot_id: String,
    pub error: String,
}

/// Per-robot result of a push or revert command. Partial failures are
/// data, not errors: the caller records them and carries on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<RobotPushFailure>,
}

/// Command channel to the robot fleet: who is eligible for a canary, and
/// pushing or reverting a model version on a robot subset.
#[async_trait]
pub trait RobotFleet: Send + Sync {
    async fn eligible_robots(&self) -> FleetResult<Vec<String>>;

    async fn push_model_version(
        &self,
        robot_ids: &[String],
        model_version_id: &str,
    ) -> FleetResult<PushOutcome>;

    /// Revert the given robots to the version they ran before the canary.
    async fn revert_model_version(&self, robot_ids: &[String]) -> FleetResult<PushOutcome>;
}

/// Fleet gateway client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRobotFleet {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    robot_ids: &'a [String],
    model_version_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RevertRequest<'a> {
    robot_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EligibleRobotsResponse {
    robots: Vec<String>,
}

impl HttpRobotFleet {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn check(response: reqwest::Response) -> FleetResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(FleetError::Endpoint {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl RobotFleet for HttpRobotFleet {
    async fn eligible_robots(&self) -> FleetResult<Vec<String>> {
        let url = format!("{}/robots/eligible", self.base_url);
        let response = Self::check(self.client.get(&url).send().await?).await?;
        let body: EligibleRobotsResponse = response.json().await?;
        Ok(body.robots)
    }

    async fn push_model_version(
        &self,
        robot_ids: &[String],
        model_version_id: &str,
    ) -> FleetResult<PushOutcome> {
        let url = format!("{}/robots/push", self.base_url);
        let request = PushRequest {
            robot_ids,
            model_version_id,
        };
        let response = Self::check(self.client.post(&url).json(&request).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn revert_model_version(&self, robot_ids: &[String]) -> FleetResult<PushOutcome> {
        let url = format!("{}/robots/revert", self.base_url);
        let request = RevertRequest { robot_ids };
        let response = Self::check(self.client.post(&url).json(&request).send().await?).await?;
        Ok(response.json().await?)
    }
}

/// In-memory fleet for tests: a fixed robot roster, with optional
/// per-robot push failures and a switch that fails the whole channel.
#[derive(Debug, Default)]
pub struct MockRobotFleet {
    robots: Vec<String>,
    failing_robots: Mutex<HashSet<String>>,
    channel_down: Mutex<bool>,
}

impl MockRobotFleet {
    pub fn with_robots(count: usize) -> Self {
        Self {
            robots: (1..=count).map(|i| format!("robot-{i:03}")).collect(),
            failing_robots: Mutex::new(HashSet::new()),
            channel_down: Mutex::new(false),
        }
    }

    pub fn fail_robot(&self, robot_id: impl Into<String>) {
        self.failing_robots
            .lock()
            .expect("fleet mock lock poisoned")
            .insert(robot_id.into());
    }

    pub fn set_channel_down(&self, down: bool) {
        *self.channel_down.lock().expect("fleet mock lock poisoned") = down;
    }

    fn split(&self, robot_ids: &[String]) -> PushOutcome {
        let failing = self.failing_robots.lock().expect("fleet mock lock poisoned");
        let mut outcome = PushOutcome::default();
        for robot_id in robot_ids {
            if failing.contains(robot_id) {
                outcome.failed.push(RobotPushFailure {
                    robot_id: robot_id.clone(),
                    error: "update rejected".to_string(),
                });
            } else {
                outcome.succeeded.push(robot_id.clone());
            }
        }
        outcome
    }

    fn ensure_channel(&self) -> FleetResult<()> {
        if *self.channel_down.lock().expect("fleet mock lock poisoned") {
            Err(FleetError::Endpoint {
                status: 503,
                message: "fleet gateway unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RobotFleet for MockRobotFleet {
    async fn eligible_robots(&self) -> FleetResult<Vec<String>> {
        self.ensure_channel()?;
        Ok(self.robots.clone())
    }

    async fn push_model_version(
        &self,
        robot_ids: &[String],
        _model_version_id: &str,
    ) -> FleetResult<PushOutcome> {
        self.ensure_channel()?;
        Ok(self.split(robot_ids))
    }

    async fn revert_model_version(&self, robot_ids: &[String]) -> FleetResult<PushOutcome> {
        self.ensure_channel()?;
        Ok(PushOutcome {
            succeeded: robot_ids.to_vec(),
            failed: Vec::new(),
        })
    }
}
