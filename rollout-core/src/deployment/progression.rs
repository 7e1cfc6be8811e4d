//! Stage progression rules: which stage a deployment is in, which stage
//! comes next, and when the dwell-time gate opens. Pure functions over the
//! sorted stage list so they stay testable independent of the transport
//! and persistence layers.

use chrono::{DateTime, Duration, Utc};

use super::model::CanaryStage;

/// 1-based ordinal of the highest stage whose percentage is at or below
/// the current traffic, for display. `None` before any stage is reached.
///
/// Relies on the stage list being strictly ascending; ties are impossible.
pub fn current_stage_index(traffic: u8, stages: &[CanaryStage]) -> Option<usize> {
    stages
        .iter()
        .rposition(|stage| stage.percentage <= traffic)
        .map(|index| index + 1)
}

/// The stage the deployment currently sits on, if any.
pub fn current_stage(traffic: u8, stages: &[CanaryStage]) -> Option<&CanaryStage> {
    current_stage_index(traffic, stages).map(|ordinal| &stages[ordinal - 1])
}

/// The next stage to expand into. `None` once traffic is at the final
/// stage; progression is strictly forward, retreat is rollback or cancel.
pub fn next_stage(traffic: u8, stages: &[CanaryStage]) -> Option<&CanaryStage> {
    stages.iter().find(|stage| stage.percentage > traffic)
}

/// Earliest instant at which the dwell-time gate for `stage` opens.
pub fn next_eligible_time(stage_started_at: DateTime<Utc>, stage: &CanaryStage) -> DateTime<Utc> {
    stage_started_at + Duration::minutes(i64::from(stage.duration_minutes))
}

/// Whether the dwell time of `stage` has fully elapsed.
pub fn dwell_elapsed(now: DateTime<Utc>, stage_started_at: DateTime<Utc>, stage: &CanaryStage) -> bool {
    now >= next_eligible_time(stage_started_at, stage)
}

/// Remaining dwell time, floored at zero.
pub fn dwell_remaining(
    now: DateTime<Utc>,
    stage_started_at: DateTime<Utc>,
    stage: &CanaryStage,
) -> Duration {
    let remaining = next_eligible_time(stage_started_at, stage) - now;
    if remaining < Duration::zero() {
        Duration::zero()
    } else {
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::model::CanaryStage;

    fn stages() -> Vec<CanaryStage> {
        vec![
            CanaryStage::new(10, 5),
            CanaryStage::new(50, 10),
            CanaryStage::new(100, 10),
        ]
    }

    #[test]
    fn stage_index_tracks_traffic() {
        let stages = stages();
        assert_eq!(current_stage_index(0, &stages), None);
        assert_eq!(current_stage_index(10, &stages), Some(1));
        assert_eq!(current_stage_index(49, &stages), Some(1));
        assert_eq!(current_stage_index(50, &stages), Some(2));
        assert_eq!(current_stage_index(100, &stages), Some(3));
    }

    #[test]
    fn next_stage_is_strictly_forward() {
        let stages = stages();
        assert_eq!(next_stage(0, &stages).unwrap().percentage, 10);
        assert_eq!(next_stage(10, &stages).unwrap().percentage, 50);
        assert_eq!(next_stage(50, &stages).unwrap().percentage, 100);
        assert!(next_stage(100, &stages).is_none());
    }

    #[test]
    fn dwell_gate_opens_after_duration() {
        let stage = CanaryStage::new(10, 5);
        let started = Utc::now() - Duration::minutes(3);
        assert!(!dwell_elapsed(Utc::now(), started, &stage));
        let remaining = dwell_remaining(Utc::now(), started, &stage);
        assert!(remaining > Duration::minutes(1) && remaining <= Duration::minutes(2));

        let started_long_ago = Utc::now() - Duration::minutes(6);
        assert!(dwell_elapsed(Utc::now(), started_long_ago, &stage));
        assert_eq!(
            dwell_remaining(Utc::now(), started_long_ago, &stage),
            Duration::zero()
        );
    }

    #[test]
    fn zero_duration_stage_is_immediately_eligible() {
        let stage = CanaryStage::new(100, 0);
        let now = Utc::now();
        assert!(dwell_elapsed(now, now, &stage));
    }
}
