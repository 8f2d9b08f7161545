//! Core Task type: a bounded unit of required repetitions.
//!
//! # Invariants
//! - `passed_count <= current_count <= required_count`
//! - `passed_count` never decreases
//! - `status == Passed` iff `passed_count == required_count`
//! - Tasks are never deleted; they only move through status transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cohort::CohortScheduleConfig;
use crate::curriculum::{CurriculumPosition, LineRange, PositionPoint, Stage};
use crate::ids::{CohortId, LearnerId, TaskId};

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// PendingStart -> InProgress -> Passed
///                           \-> Failed -> Cancelled
///             \-----------------------\-> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Planned but not yet accepting submissions
    PendingStart,
    /// Accepting submissions
    InProgress,
    /// Every required repetition passed
    Passed,
    /// All slots consumed with at least one failure; a remedial task follows
    Failed,
    /// Withdrawn by an administrator or the reconciler
    Cancelled,
}

impl TaskStatus {
    /// Check if the task can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Passed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::PendingStart => "PENDING_START",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Passed => "PASSED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_START" => Ok(TaskStatus::PendingStart),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "PASSED" => Ok(TaskStatus::Passed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

/// What a recorded outcome did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskProgress {
    /// Open slots remain
    Continuing { remaining: u32 },
    /// `passed_count` reached `required_count`
    Completed,
    /// Every slot was used but some failed
    Exhausted { failed: u32 },
    /// The task was already closed; the decision is kept for audit only
    Detached,
}

/// A unit of required repetitions for one learner in one cohort.
///
/// Fields are crate-private so counts and status only change through the
/// transition methods below, which the lifecycle manager drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) learner_id: LearnerId,
    pub(crate) cohort_id: CohortId,
    pub(crate) stage: Stage,
    pub(crate) page_ref: u32,
    pub(crate) line_range: LineRange,
    /// Explicit lines for a remedial learn task; empty means the whole range
    pub(crate) focus_lines: Vec<u32>,
    pub(crate) required_count: u32,
    pub(crate) current_count: u32,
    pub(crate) passed_count: u32,
    pub(crate) status: TaskStatus,
    /// The task this one repeats the failed items of
    pub(crate) remedial_of: Option<TaskId>,
    /// The remedial task spawned when this one failed
    pub(crate) remedial_task_id: Option<TaskId>,
    pub(crate) cancel_reason: Option<String>,
    /// Enforced deadline (only when the cohort enables deadlines)
    pub(crate) deadline: Option<DateTime<Utc>>,
    /// Nominal due time, always stamped for analytics
    pub(crate) expected_by: DateTime<Utc>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) version: u64,
}

impl Task {
    /// Plan the task for a learner's current position.
    ///
    /// # Postconditions
    /// - `status == PendingStart`
    /// - learn stages: one repetition per line from `position.line` to the end of the half
    /// - review/consolidate stages: `schedule.repetition_count` repetitions over the span
    pub fn for_position(
        position: &CurriculumPosition,
        schedule: &CohortScheduleConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let span = position.stage.span();
        let (line_range, required_count) = if position.stage.is_learn() {
            let range = LineRange {
                start: position.line,
                end: span.end,
            };
            (range, range.line_count())
        } else {
            (span, schedule.repetition_count.max(1))
        };
        let (deadline, expected_by) = deadline_for(position.stage, schedule, now);

        Self {
            id: TaskId::new(),
            learner_id: position.learner_id,
            cohort_id: position.cohort_id,
            stage: position.stage,
            page_ref: position.page,
            line_range,
            focus_lines: Vec::new(),
            required_count,
            current_count: 0,
            passed_count: 0,
            status: TaskStatus::PendingStart,
            remedial_of: None,
            remedial_task_id: None,
            cancel_reason: None,
            deadline,
            expected_by,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Plan a remedial task covering only `failed_items` of `parent`.
    ///
    /// For learn stages the items are line numbers; otherwise they are
    /// repetition indices and only their count matters.
    ///
    /// # Errors
    /// Fails when `failed_items` is empty.
    pub fn remedial(
        parent: &Task,
        mut failed_items: Vec<u32>,
        schedule: &CohortScheduleConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, TaskError> {
        if failed_items.is_empty() {
            return Err(TaskError::EmptyRemedial);
        }
        failed_items.sort_unstable();
        failed_items.dedup();

        let (line_range, focus_lines) = if parent.stage.is_learn() {
            let first = failed_items[0];
            let last = failed_items[failed_items.len() - 1];
            (LineRange { start: first, end: last }, failed_items.clone())
        } else {
            (parent.line_range, Vec::new())
        };
        let (deadline, expected_by) = deadline_for(parent.stage, schedule, now);

        Ok(Self {
            id: TaskId::new(),
            learner_id: parent.learner_id,
            cohort_id: parent.cohort_id,
            stage: parent.stage,
            page_ref: parent.page_ref,
            line_range,
            focus_lines,
            required_count: failed_items.len() as u32,
            current_count: 0,
            passed_count: 0,
            status: TaskStatus::PendingStart,
            remedial_of: Some(parent.id),
            remedial_task_id: None,
            cancel_reason: None,
            deadline,
            expected_by,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn learner_id(&self) -> LearnerId {
        self.learner_id
    }

    pub fn cohort_id(&self) -> CohortId {
        self.cohort_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn page_ref(&self) -> u32 {
        self.page_ref
    }

    pub fn line_range(&self) -> LineRange {
        self.line_range
    }

    pub fn focus_lines(&self) -> &[u32] {
        &self.focus_lines
    }

    pub fn required_count(&self) -> u32 {
        self.required_count
    }

    pub fn current_count(&self) -> u32 {
        self.current_count
    }

    pub fn passed_count(&self) -> u32 {
        self.passed_count
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn remedial_of(&self) -> Option<TaskId> {
        self.remedial_of
    }

    pub fn remedial_task_id(&self) -> Option<TaskId> {
        self.remedial_task_id
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn expected_by(&self) -> DateTime<Utc> {
        self.expected_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The (stage, page, line) this task was scoped for.
    pub fn expected_point(&self) -> PositionPoint {
        PositionPoint {
            stage: self.stage,
            page: self.page_ref,
            line: self.line_range.start,
        }
    }

    /// The item (line or repetition index) proven by the submission in `slot`.
    ///
    /// Returns `None` when `slot` is past the last required repetition.
    pub fn slot_item(&self, slot: u32) -> Option<u32> {
        if slot >= self.required_count {
            return None;
        }
        if !self.stage.is_learn() {
            return Some(slot + 1);
        }
        if self.focus_lines.is_empty() {
            Some(self.line_range.start + slot)
        } else {
            self.focus_lines.get(slot as usize).copied()
        }
    }

    /// Every item this task requires, in slot order.
    pub fn items(&self) -> Vec<u32> {
        (0..self.required_count)
            .filter_map(|slot| self.slot_item(slot))
            .collect()
    }

    // State transitions - explicit and validated

    /// Transition the task to InProgress.
    ///
    /// # Precondition
    /// `self.status == PendingStart`
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TaskError> {
        match self.status {
            TaskStatus::PendingStart => {
                self.status = TaskStatus::InProgress;
                self.updated_at = now;
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: other,
                to: TaskStatus::InProgress,
            }),
        }
    }

    /// Count one decided submission.
    ///
    /// # Precondition
    /// `self.status == InProgress` and an open slot remains.
    ///
    /// # Postconditions
    /// - `current_count` grows by one, `passed_count` by one iff `passed`
    /// - `Passed` when every repetition passed, `Failed` when the slots ran out first
    pub fn record_outcome(
        &mut self,
        passed: bool,
        now: DateTime<Utc>,
    ) -> Result<TaskProgress, TaskError> {
        if self.status != TaskStatus::InProgress {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: TaskStatus::InProgress,
            });
        }
        if self.current_count >= self.required_count {
            return Err(TaskError::NoOpenSlot {
                required: self.required_count,
            });
        }

        self.current_count += 1;
        if passed {
            self.passed_count += 1;
        }
        self.updated_at = now;

        if self.passed_count == self.required_count {
            self.status = TaskStatus::Passed;
            Ok(TaskProgress::Completed)
        } else if self.current_count == self.required_count {
            self.status = TaskStatus::Failed;
            Ok(TaskProgress::Exhausted {
                failed: self.current_count - self.passed_count,
            })
        } else {
            Ok(TaskProgress::Continuing {
                remaining: self.required_count - self.current_count,
            })
        }
    }

    /// Transition the task to Cancelled.
    ///
    /// Idempotent: returns `Ok(false)` when the task is already cancelled.
    ///
    /// # Errors
    /// Passed tasks and failed tasks already replaced by a remedial task are
    /// part of the audit trail and cannot be cancelled.
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<bool, TaskError> {
        match self.status {
            TaskStatus::Cancelled => Ok(false),
            TaskStatus::Passed => Err(TaskError::InvalidTransition {
                from: self.status,
                to: TaskStatus::Cancelled,
            }),
            TaskStatus::Failed if self.remedial_task_id.is_some() => {
                Err(TaskError::InvalidTransition {
                    from: self.status,
                    to: TaskStatus::Cancelled,
                })
            }
            TaskStatus::PendingStart | TaskStatus::InProgress | TaskStatus::Failed => {
                self.status = TaskStatus::Cancelled;
                self.cancel_reason = Some(reason.to_string());
                self.updated_at = now;
                Ok(true)
            }
        }
    }

    pub(crate) fn link_remedial(&mut self, remedial: TaskId) {
        self.remedial_task_id = Some(remedial);
    }
}

fn deadline_for(
    stage: Stage,
    schedule: &CohortScheduleConfig,
    now: DateTime<Utc>,
) -> (Option<DateTime<Utc>>, DateTime<Utc>) {
    let expected_by = now + schedule.duration_for(stage.group());
    let deadline = schedule.deadlines_enabled.then_some(expected_by);
    (deadline, expected_by)
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("All {required} slots of the task are already used")]
    NoOpenSlot { required: u32 },

    #[error("A remedial task needs at least one failed item")]
    EmptyRemedial,

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(page: u32, line: u32, stage: Stage) -> CurriculumPosition {
        CurriculumPosition::new(LearnerId::new(), CohortId::new(), page, line, stage).unwrap()
    }

    fn started(position: &CurriculumPosition) -> Task {
        let mut task = Task::for_position(position, &CohortScheduleConfig::default(), Utc::now());
        task.start(Utc::now()).unwrap();
        task
    }

    #[test]
    fn learn_task_requires_one_repetition_per_remaining_line() {
        let task = started(&position(4, 1, Stage::S1Learn));
        assert_eq!(task.required_count(), 7);
        assert_eq!(task.line_range(), LineRange { start: 1, end: 7 });
        assert_eq!(task.items(), vec![1, 2, 3, 4, 5, 6, 7]);

        let task = started(&position(4, 10, Stage::S2Learn));
        assert_eq!(task.required_count(), 6);
        assert_eq!(task.slot_item(0), Some(10));
        assert_eq!(task.slot_item(5), Some(15));
        assert_eq!(task.slot_item(6), None);
    }

    #[test]
    fn review_task_uses_cohort_repetition_count() {
        let schedule = CohortScheduleConfig {
            repetition_count: 80,
            ..Default::default()
        };
        let task = Task::for_position(&position(4, 1, Stage::S1Review), &schedule, Utc::now());
        assert_eq!(task.required_count(), 80);
        assert_eq!(task.line_range(), LineRange { start: 1, end: 7 });
        assert_eq!(task.status(), TaskStatus::PendingStart);
        assert_eq!(task.slot_item(79), Some(80));
    }

    #[test]
    fn passes_exactly_when_all_repetitions_pass() {
        let mut task = started(&position(1, 5, Stage::S1Learn));
        assert_eq!(task.required_count(), 3);
        let now = Utc::now();
        assert_eq!(
            task.record_outcome(true, now).unwrap(),
            TaskProgress::Continuing { remaining: 2 }
        );
        assert_eq!(
            task.record_outcome(true, now).unwrap(),
            TaskProgress::Continuing { remaining: 1 }
        );
        assert_eq!(task.status(), TaskStatus::InProgress);
        assert_eq!(task.record_outcome(true, now).unwrap(), TaskProgress::Completed);
        assert_eq!(task.status(), TaskStatus::Passed);
        assert_eq!(task.passed_count(), task.required_count());
    }

    #[test]
    fn fails_when_slots_run_out_with_failures() {
        let mut task = started(&position(1, 6, Stage::S1Learn));
        let now = Utc::now();
        task.record_outcome(false, now).unwrap();
        let progress = task.record_outcome(true, now).unwrap();
        assert_eq!(progress, TaskProgress::Exhausted { failed: 1 });
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.current_count() >= task.passed_count());
        assert!(matches!(
            task.record_outcome(true, now),
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn counts_are_monotonic() {
        let mut task = started(&position(2, 1, Stage::S1Learn));
        let now = Utc::now();
        let mut last_passed = 0;
        for passed in [true, false, true, false, true, true, false] {
            task.record_outcome(passed, now).unwrap();
            assert!(task.current_count() >= task.passed_count());
            assert!(task.passed_count() >= last_passed);
            last_passed = task.passed_count();
        }
    }

    #[test]
    fn remedial_learn_task_targets_failed_lines_only() {
        let parent = started(&position(3, 1, Stage::S1Learn));
        let remedial =
            Task::remedial(&parent, vec![5, 2, 5], &CohortScheduleConfig::default(), Utc::now())
                .unwrap();
        assert_eq!(remedial.required_count(), 2);
        assert_eq!(remedial.focus_lines(), &[2, 5]);
        assert_eq!(remedial.line_range(), LineRange { start: 2, end: 5 });
        assert_eq!(remedial.items(), vec![2, 5]);
        assert_eq!(remedial.remedial_of(), Some(parent.id()));
    }

    #[test]
    fn remedial_review_task_counts_failed_repetitions() {
        let parent = started(&position(3, 1, Stage::S1Review));
        let remedial =
            Task::remedial(&parent, vec![17], &CohortScheduleConfig::default(), Utc::now())
                .unwrap();
        assert_eq!(remedial.required_count(), 1);
        assert_eq!(remedial.line_range(), parent.line_range());
        assert!(remedial.focus_lines().is_empty());
        assert!(Task::remedial(&parent, vec![], &CohortScheduleConfig::default(), Utc::now()).is_err());
    }

    #[test]
    fn cancel_is_idempotent_and_refuses_passed_tasks() {
        let now = Utc::now();
        let mut task = started(&position(1, 1, Stage::S1Learn));
        assert!(task.cancel("stale position", now).unwrap());
        assert!(!task.cancel("stale position", now).unwrap());
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(task.cancel_reason(), Some("stale position"));

        let mut done = started(&position(1, 7, Stage::S1Learn));
        done.record_outcome(true, now).unwrap();
        assert!(done.cancel("x", now).is_err());

        let mut failed = started(&position(1, 7, Stage::S1Learn));
        failed.record_outcome(false, now).unwrap();
        let mut replaced = failed.clone();
        replaced.link_remedial(TaskId::new());
        assert!(replaced.cancel("x", now).is_err());
        assert!(failed.cancel("stale position", now).unwrap());
    }

    #[test]
    fn deadline_only_set_when_enabled_but_expected_by_always_stamped() {
        let now = Utc::now();
        let pos = position(1, 1, Stage::S1Learn);
        let disabled = Task::for_position(&pos, &CohortScheduleConfig::default(), now);
        assert!(disabled.deadline().is_none());
        assert!(disabled.expected_by() > now);

        let enabled = CohortScheduleConfig {
            deadlines_enabled: true,
            ..Default::default()
        };
        let task = Task::for_position(&pos, &enabled, now);
        assert_eq!(task.deadline(), Some(now + chrono::Duration::hours(24)));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            TaskStatus::PendingStart,
            TaskStatus::InProgress,
            TaskStatus::Passed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }
}
