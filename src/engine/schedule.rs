//! Stage timeline and the ramp scheduler that turns it into a live VU target.

use std::time::Duration;

use crate::cli::config::ScheduleStep;
use crate::error::ConfigError;
use crate::utils::parse_duration_str;

/// One ramp segment: reach `target` VUs by the end of `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Ordered, validated list of stages. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTimeline {
    stages: Vec<Stage>,
    total: Duration,
}

impl StageTimeline {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptyTimeline);
        }
        if let Some(index) = stages.iter().position(|s| s.duration.is_zero()) {
            return Err(ConfigError::ZeroStageDuration { index });
        }
        let total = stages.iter().map(|s| s.duration).sum();
        Ok(Self { stages, total })
    }

    /// Build from raw `{ duration: "10s", target: 500 }` steps.
    pub fn from_steps(steps: &[ScheduleStep]) -> Result<Self, ConfigError> {
        let stages = steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                parse_duration_str(&step.duration)
                    .map(|d| Stage::new(d, step.target))
                    .ok_or_else(|| ConfigError::duration(format!("stages[{}].duration", i), &step.duration))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn peak_target(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Index of the stage containing `elapsed`, `None` once the timeline is over.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            end += stage.duration;
            if elapsed < end {
                return Some(i);
            }
        }
        None
    }
}

/// Converts elapsed run time into the desired number of concurrent VUs.
///
/// Inside a stage the count is linearly interpolated from the previous
/// stage's target (0 before the first stage) to the stage's own target and
/// rounded to the nearest integer. `elapsed == total` still belongs to the
/// last stage; anything later is 0.
#[derive(Debug, Clone)]
pub struct RampScheduler {
    timeline: StageTimeline,
}

impl RampScheduler {
    pub fn new(timeline: StageTimeline) -> Self {
        Self { timeline }
    }

    pub fn desired_at(&self, elapsed: Duration) -> usize {
        let mut active_time = Duration::ZERO;
        let mut prev_target = 0usize;
        for stage in &self.timeline.stages {
            let stage_end = active_time + stage.duration;
            if elapsed < stage_end {
                let progress = (elapsed - active_time).as_secs_f64() / stage.duration.as_secs_f64();
                let diff = stage.target as f64 - prev_target as f64;
                return (prev_target as f64 + diff * progress).round().max(0.0) as usize;
            }
            active_time = stage_end;
            prev_target = stage.target;
        }
        if elapsed == active_time {
            prev_target
        } else {
            0
        }
    }

    pub fn is_finished(&self, elapsed: Duration) -> bool {
        elapsed >= self.timeline.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue_timeline() -> StageTimeline {
        StageTimeline::new(vec![
            Stage::new(Duration::from_secs(10), 500),
            Stage::new(Duration::from_secs(30), 1000),
            Stage::new(Duration::from_secs(10), 0),
        ])
        .unwrap()
    }

    #[test]
    fn test_timeline_validation() {
        assert_eq!(StageTimeline::new(vec![]), Err(ConfigError::EmptyTimeline));
        let err = StageTimeline::new(vec![
            Stage::new(Duration::from_secs(1), 5),
            Stage::new(Duration::ZERO, 5),
        ])
        .unwrap_err();
        assert_eq!(err, ConfigError::ZeroStageDuration { index: 1 });
    }

    #[test]
    fn test_timeline_from_steps() {
        let steps = vec![
            ScheduleStep { duration: "10s".into(), target: 5 },
            ScheduleStep { duration: "1m".into(), target: 10 },
        ];
        let timeline = StageTimeline::from_steps(&steps).unwrap();
        assert_eq!(timeline.total_duration(), Duration::from_secs(70));
        assert_eq!(timeline.peak_target(), 10);

        let bad = vec![ScheduleStep { duration: "soon".into(), target: 5 }];
        assert!(matches!(
            StageTimeline::from_steps(&bad),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn test_queue_scenario_targets() {
        let scheduler = RampScheduler::new(queue_timeline());
        assert_eq!(scheduler.desired_at(Duration::ZERO), 0);
        assert_eq!(scheduler.desired_at(Duration::from_secs(5)), 250);
        assert_eq!(scheduler.desired_at(Duration::from_secs(10)), 500);
        // 500 -> 1000 over 30s, 5s in
        assert_eq!(scheduler.desired_at(Duration::from_secs(15)), 583);
        assert_eq!(scheduler.desired_at(Duration::from_secs(40)), 1000);
        assert_eq!(scheduler.desired_at(Duration::from_secs(45)), 500);
        assert_eq!(scheduler.desired_at(Duration::from_secs(50)), 0);
        assert_eq!(scheduler.desired_at(Duration::from_secs(51)), 0);
    }

    #[test]
    fn test_hold_stage_is_flat() {
        let scheduler = RampScheduler::new(
            StageTimeline::new(vec![
                Stage::new(Duration::from_secs(10), 100),
                Stage::new(Duration::from_secs(30), 100),
            ])
            .unwrap(),
        );
        for s in 10..=40 {
            assert_eq!(scheduler.desired_at(Duration::from_secs(s)), 100);
        }
    }

    #[test]
    fn test_final_stage_end_keeps_target_then_clamps() {
        let scheduler = RampScheduler::new(
            StageTimeline::new(vec![Stage::new(Duration::from_secs(2), 8)]).unwrap(),
        );
        assert_eq!(scheduler.desired_at(Duration::from_secs(2)), 8);
        assert!(scheduler.is_finished(Duration::from_secs(2)));
        assert_eq!(scheduler.desired_at(Duration::from_millis(2001)), 0);
    }

    #[test]
    fn test_stage_index_at() {
        let timeline = queue_timeline();
        assert_eq!(timeline.stage_index_at(Duration::from_secs(0)), Some(0));
        assert_eq!(timeline.stage_index_at(Duration::from_secs(10)), Some(1));
        assert_eq!(timeline.stage_index_at(Duration::from_secs(49)), Some(2));
        assert_eq!(timeline.stage_index_at(Duration::from_secs(50)), None);
    }

    proptest! {
        #[test]
        fn prop_boundary_continuity(
            raw in prop::collection::vec((1u64..120_000, 0usize..5_000), 1..8)
        ) {
            let stages: Vec<Stage> = raw
                .iter()
                .map(|(ms, target)| Stage::new(Duration::from_millis(*ms), *target))
                .collect();
            let scheduler = RampScheduler::new(StageTimeline::new(stages.clone()).unwrap());

            let mut start = Duration::ZERO;
            let mut prev_target = 0usize;
            for stage in &stages {
                let end = start + stage.duration;
                prop_assert_eq!(scheduler.desired_at(start), prev_target);
                prop_assert_eq!(scheduler.desired_at(end), stage.target);
                start = end;
                prev_target = stage.target;
            }
        }

        #[test]
        fn prop_desired_stays_between_endpoints(
            raw in prop::collection::vec((1u64..60_000, 0usize..2_000), 1..6),
            at_ms in 0u64..400_000,
        ) {
            let stages: Vec<Stage> = raw
                .iter()
                .map(|(ms, target)| Stage::new(Duration::from_millis(*ms), *target))
                .collect();
            let timeline = StageTimeline::new(stages.clone()).unwrap();
            let scheduler = RampScheduler::new(timeline.clone());
            let at = Duration::from_millis(at_ms);
            let desired = scheduler.desired_at(at);

            match timeline.stage_index_at(at) {
                Some(i) => {
                    let from = if i == 0 { 0 } else { stages[i - 1].target };
                    let to = stages[i].target;
                    prop_assert!(desired >= from.min(to) && desired <= from.max(to));
                }
                None if at > timeline.total_duration() => prop_assert_eq!(desired, 0),
                None => prop_assert_eq!(desired, stages[stages.len() - 1].target),
            }
        }
    }
}
