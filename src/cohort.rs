//! Per-cohort schedule configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::curriculum::StageGroup;

/// Repetition and deadline settings shared by every learner of a cohort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortScheduleConfig {
    /// Required repetitions for review and consolidation stages
    pub repetition_count: u32,
    /// Hours allowed per stage group: `[learn, review, consolidate]`
    pub stage_durations_hours: [u32; 3],
    /// Whether overdue tracking is switched on
    pub deadlines_enabled: bool,
}

impl Default for CohortScheduleConfig {
    fn default() -> Self {
        Self {
            repetition_count: 80,
            stage_durations_hours: [24, 72, 168],
            deadlines_enabled: false,
        }
    }
}

impl CohortScheduleConfig {
    pub fn duration_for(&self, group: StageGroup) -> Duration {
        Duration::hours(i64::from(self.stage_durations_hours[group.index()]))
    }

    /// Reject configurations that would create tasks nobody can finish.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.repetition_count == 0 {
            return Err(ScheduleError::ZeroRepetitions);
        }
        if self.deadlines_enabled && self.stage_durations_hours.contains(&0) {
            return Err(ScheduleError::ZeroDuration);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("repetition_count must be at least 1")]
    ZeroRepetitions,

    #[error("stage durations must be positive when deadlines are enabled")]
    ZeroDuration,
}
