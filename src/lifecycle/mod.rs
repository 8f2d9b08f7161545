//! Task lifecycle manager - the only writer of task counts and status.
//!
//! Every operation reads current state, stages its writes in a
//! [`ChangeSet`], and commits them in one store transaction. A lost version
//! race surfaces as a store conflict; the operation then re-reads and tries
//! again, up to `max_write_retries` times.
//!
//! # Invariants
//! - At most one IN_PROGRESS task per (learner, cohort)
//! - A task's PASSED transition, the position advance, and the next task's
//!   creation land together or not at all
//! - A failed task is replaced by a remedial task covering only its failed items
//! - Recording a submission also rewrites its task, so a task cannot be
//!   cancelled from a read that missed a newer submission

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cohort::CohortScheduleConfig;
use crate::curriculum::CurriculumPosition;
use crate::error::{EngineError, EngineResult};
use crate::ids::{CohortId, LearnerId, SubmissionId, TaskId};
use crate::notify::Notification;
use crate::reconcile::detect_drift;
use crate::store::{ChangeSet, ProgressStore, Write};
use crate::task::{
    Decision, ProofKind, Submission, SubmissionStatus, Task, TaskProgress, TaskStatus,
};

/// A proof about to be recorded against the active task.
#[derive(Debug, Clone)]
pub struct SubmissionDraft {
    pub proof_kind: ProofKind,
    pub proof_ref: String,
    pub ai_score: Option<u8>,
    /// The task the proof was scored against; recording fails if another
    /// task became active in the meantime
    pub for_task: Option<TaskId>,
}

/// What a counted outcome did.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeReport {
    /// The task after the outcome was applied
    pub task: Task,
    pub progress: TaskProgress,
    /// The successor (after a pass) or remedial (after a failure) task
    pub next_task: Option<Task>,
    /// The learner's position if this outcome moved it
    pub position: Option<CurriculumPosition>,
    pub notifications: Vec<Notification>,
}

impl OutcomeReport {
    fn detached(task: Task) -> Self {
        Self {
            task,
            progress: TaskProgress::Detached,
            next_task: None,
            position: None,
            notifications: Vec::new(),
        }
    }

    /// Reflect the version bumps the store applied on commit.
    fn committed(mut self) -> Self {
        if !matches!(self.progress, TaskProgress::Detached) {
            self.task.version += 1;
        }
        if let Some(position) = self.position.as_mut() {
            position.version += 1;
        }
        self
    }
}

/// Result of recording a new submission.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedSubmission {
    pub submission: Submission,
    pub decision: Decision,
    /// Present when the decision was automatic and counted immediately
    pub outcome: Option<OutcomeReport>,
    pub notifications: Vec<Notification>,
}

/// Result of [`TaskLifecycleManager::replace_stale_task`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplaceOutcome {
    Replaced {
        cancelled: Task,
        /// `None` when the enrollment is gone or another task already took its place
        recreated: Option<Task>,
    },
    /// The task was already closed, typically by a concurrent pass
    Skipped,
}

pub struct TaskLifecycleManager {
    store: Arc<dyn ProgressStore>,
    default_schedule: CohortScheduleConfig,
    max_write_retries: u32,
}

impl TaskLifecycleManager {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        default_schedule: CohortScheduleConfig,
        max_write_retries: u32,
    ) -> Self {
        Self {
            store,
            default_schedule,
            max_write_retries: max_write_retries.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// The cohort's schedule, or the service default when none was saved.
    pub async fn schedule_for(&self, cohort_id: CohortId) -> EngineResult<CohortScheduleConfig> {
        Ok(self
            .store
            .get_schedule(cohort_id)
            .await?
            .unwrap_or_else(|| self.default_schedule.clone()))
    }

    /// Run `op` until it stops hitting write conflicts.
    async fn with_retries<T, F, Fut>(&self, label: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        for attempt in 1..=self.max_write_retries {
            match op().await {
                Err(e) if e.is_retryable() => {
                    tracing::debug!("{}: write conflict on attempt {} ({})", label, attempt, e);
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
        tracing::warn!(
            "{}: giving up after {} conflicting attempts",
            label,
            self.max_write_retries
        );
        Err(EngineError::WriteConflict {
            attempts: self.max_write_retries,
        })
    }

    /// The learner's IN_PROGRESS task, if any. Never creates one.
    pub async fn active_task(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> EngineResult<Option<Task>> {
        Ok(self.store.find_in_progress_task(learner_id, cohort_id).await?)
    }

    /// Every task of the enrollment, oldest first.
    pub async fn task_history(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> EngineResult<Vec<Task>> {
        Ok(self.store.list_tasks_for_learner(learner_id, cohort_id).await?)
    }

    /// Return the IN_PROGRESS task, creating it from the live position if absent.
    ///
    /// # Errors
    /// `NotFound` when the learner has no active enrollment in the cohort.
    pub async fn ensure_active_task(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> EngineResult<Task> {
        self.with_retries("ensure_active_task", || {
            self.try_ensure_active_task(learner_id, cohort_id)
        })
        .await
    }

    async fn try_ensure_active_task(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> EngineResult<Task> {
        if let Some(task) = self.store.find_in_progress_task(learner_id, cohort_id).await? {
            return Ok(task);
        }
        let position = self.active_position(learner_id, cohort_id).await?;
        let schedule = self.schedule_for(cohort_id).await?;
        let now = Utc::now();

        let mut task = Task::for_position(&position, &schedule, now);
        task.start(now)?;
        self.store.commit(ChangeSet::new().insert_task(task.clone())).await?;

        tracing::info!(
            "Created task {} for learner {}: {} page {} lines {}-{} ({} required)",
            task.id(),
            learner_id,
            task.stage(),
            task.page_ref(),
            task.line_range().start,
            task.line_range().end,
            task.required_count()
        );
        Ok(task)
    }

    async fn active_position(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> EngineResult<CurriculumPosition> {
        match self.store.get_position(learner_id, cohort_id).await? {
            Some(position) if position.active => Ok(position),
            _ => Err(EngineError::NotFound(format!(
                "active enrollment of learner {} in cohort {}",
                learner_id, cohort_id
            ))),
        }
    }

    /// Record a submission in the next free slot of the active task.
    ///
    /// Automatic decisions (`Pass`/`Fail`) are counted in the same transaction;
    /// `PendingHuman` queues the submission for an instructor.
    ///
    /// # Errors
    /// `InvalidState` when every slot of the task already holds a submission.
    pub async fn record_submission(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
        draft: SubmissionDraft,
        decision: Decision,
    ) -> EngineResult<RecordedSubmission> {
        self.with_retries("record_submission", || {
            self.try_record_submission(learner_id, cohort_id, draft.clone(), decision)
        })
        .await
    }

    async fn try_record_submission(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
        draft: SubmissionDraft,
        decision: Decision,
    ) -> EngineResult<RecordedSubmission> {
        let task = self.try_ensure_active_task(learner_id, cohort_id).await?;
        if let Some(expected) = draft.for_task {
            if expected != task.id() {
                return Err(EngineError::InvalidState(format!(
                    "task {} is no longer active (now {}); resubmit",
                    expected,
                    task.id()
                )));
            }
        }
        let existing = self.store.list_submissions_for_task(task.id()).await?;
        let slot = existing.iter().map(|s| s.slot() + 1).max().unwrap_or(0);
        let item = task.slot_item(slot).ok_or_else(|| {
            EngineError::InvalidState(format!(
                "every slot of task {} already holds a submission",
                task.id()
            ))
        })?;

        let now = Utc::now();
        let mut submission = Submission::new(
            task.id(),
            learner_id,
            cohort_id,
            slot,
            item,
            draft.proof_kind,
            draft.proof_ref,
            draft.ai_score,
            now,
        );

        let mut changes = ChangeSet::new();
        let outcome = match decision.as_passed() {
            None => {
                // The task row is rewritten unchanged so its version moves and a
                // concurrent cancel of this task conflicts.
                changes
                    .update_task(task)
                    .insert_submission(submission.clone())
                    .notify(Notification::for_submission(&submission, decision));
                None
            }
            Some(passed) => {
                submission.decide(passed, None, now)?;
                changes
                    .insert_submission(submission.clone())
                    .notify(Notification::for_submission(&submission, decision));
                Some(self.stage_outcome(&mut changes, task, passed, now).await?)
            }
        };

        self.store.commit(&changes).await?;
        tracing::debug!(
            "Recorded submission {} (slot {}, item {}) for task {}: {:?}",
            submission.id(),
            slot,
            item,
            submission.task_id(),
            decision
        );

        Ok(RecordedSubmission {
            submission,
            decision,
            outcome: outcome.map(OutcomeReport::committed),
            notifications: changes.outbox,
        })
    }

    /// Decide a PENDING submission and count it against its task.
    ///
    /// # Errors
    /// `InvalidState` when the submission was already decided.
    pub async fn settle_submission(
        &self,
        submission_id: SubmissionId,
        passed: bool,
        reviewer_id: Option<&str>,
    ) -> EngineResult<OutcomeReport> {
        self.with_retries("settle_submission", || {
            self.try_settle_submission(submission_id, passed, reviewer_id)
        })
        .await
    }

    async fn try_settle_submission(
        &self,
        submission_id: SubmissionId,
        passed: bool,
        reviewer_id: Option<&str>,
    ) -> EngineResult<OutcomeReport> {
        let mut submission = self
            .store
            .get_submission(submission_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("submission {}", submission_id)))?;
        let now = Utc::now();
        submission.decide(passed, reviewer_id, now)?;

        let task = self
            .store
            .get_task(submission.task_id())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", submission.task_id())))?;

        let decision = if passed { Decision::Pass } else { Decision::Fail };
        let mut changes = ChangeSet::new();
        changes
            .update_submission(submission.clone())
            .notify(Notification::for_submission(&submission, decision));

        let report = if task.status() == TaskStatus::InProgress {
            self.stage_outcome(&mut changes, task, passed, now).await?
        } else {
            tracing::info!(
                "Submission {} decided after task {} closed ({}); not counted",
                submission_id,
                task.id(),
                task.status()
            );
            OutcomeReport::detached(task)
        };

        self.store.commit(&changes).await?;
        Ok(OutcomeReport {
            notifications: changes.outbox,
            ..report
        }
        .committed())
    }

    /// Count one outcome against a task without a submission record.
    pub async fn record_submission_outcome(
        &self,
        task_id: TaskId,
        passed: bool,
    ) -> EngineResult<OutcomeReport> {
        self.with_retries("record_submission_outcome", || async move {
            let task = self.load_task(task_id).await?;
            let mut changes = ChangeSet::new();
            let report = self.stage_outcome(&mut changes, task, passed, Utc::now()).await?;
            self.store.commit(&changes).await?;
            Ok(report.committed())
        })
        .await
    }

    /// Cancel a task. Cancelling a cancelled task is a no-op.
    pub async fn cancel(&self, task_id: TaskId, reason: &str) -> EngineResult<Task> {
        self.with_retries("cancel", || async move {
            let mut task = self.load_task(task_id).await?;
            if !task.cancel(reason, Utc::now())? {
                return Ok(task);
            }
            self.store.commit(ChangeSet::new().update_task(task.clone())).await?;
            tracing::info!("Cancelled task {}: {}", task_id, reason);
            task.version += 1;
            Ok(task)
        })
        .await
    }

    /// Cancel a stale task and plan a fresh one from the live position, atomically.
    ///
    /// # Errors
    /// `ReconciliationConflict` when the task still holds unreviewed submissions.
    pub async fn replace_stale_task(
        &self,
        task_id: TaskId,
        reason: &str,
    ) -> EngineResult<ReplaceOutcome> {
        self.with_retries("replace_stale_task", || {
            self.try_replace_stale_task(task_id, reason)
        })
        .await
    }

    async fn try_replace_stale_task(
        &self,
        task_id: TaskId,
        reason: &str,
    ) -> EngineResult<ReplaceOutcome> {
        let mut task = self.load_task(task_id).await?;
        let replaceable = match task.status() {
            TaskStatus::InProgress | TaskStatus::PendingStart => true,
            TaskStatus::Failed => task.remedial_task_id().is_none(),
            TaskStatus::Passed | TaskStatus::Cancelled => false,
        };
        if !replaceable {
            return Ok(ReplaceOutcome::Skipped);
        }

        let pending = self
            .store
            .list_submissions_for_task(task_id)
            .await?
            .iter()
            .filter(|s| s.status() == SubmissionStatus::Pending)
            .count();
        if pending > 0 {
            return Err(EngineError::ReconciliationConflict { task_id, pending });
        }

        let now = Utc::now();
        task.cancel(reason, now)?;
        let mut changes = ChangeSet::new();
        changes.update_task(task.clone());

        let (learner_id, cohort_id) = (task.learner_id(), task.cohort_id());
        let other_active = self
            .store
            .find_in_progress_task(learner_id, cohort_id)
            .await?
            .filter(|t| t.id() != task_id);
        let position = self.store.get_position(learner_id, cohort_id).await?;

        let recreated = match position {
            Some(position) if position.active && other_active.is_none() => {
                let schedule = self.schedule_for(cohort_id).await?;
                let mut fresh = Task::for_position(&position, &schedule, now);
                fresh.start(now)?;
                changes.insert_task(fresh.clone());
                Some(fresh)
            }
            _ => None,
        };

        self.store.commit(&changes).await?;
        tracing::info!(
            "Replaced task {} ({}); recreated: {}",
            task_id,
            reason,
            recreated
                .as_ref()
                .map(|t| t.id().to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        task.version += 1;
        Ok(ReplaceOutcome::Replaced {
            cancelled: task,
            recreated,
        })
    }

    async fn load_task(&self, task_id: TaskId) -> EngineResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))
    }

    /// Apply one outcome to `task` and stage every resulting write in `changes`.
    async fn stage_outcome(
        &self,
        changes: &mut ChangeSet,
        mut task: Task,
        passed: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<OutcomeReport> {
        let progress = task.record_outcome(passed, now)?;
        let mut report = OutcomeReport {
            task: task.clone(),
            progress,
            next_task: None,
            position: None,
            notifications: Vec::new(),
        };

        match progress {
            TaskProgress::Continuing { .. } | TaskProgress::Detached => {
                changes.update_task(task);
            }
            TaskProgress::Completed => {
                let live = self.store.get_position(task.learner_id(), task.cohort_id()).await?;
                match live {
                    Some(position)
                        if !detect_drift(&task.expected_point(), Some(&position)).is_drifted() =>
                    {
                        let schedule = self.schedule_for(task.cohort_id()).await?;
                        let advanced = position.advanced();
                        let mut next = Task::for_position(&advanced, &schedule, now);
                        next.start(now)?;

                        tracing::info!(
                            "Task {} passed; learner {} advances to {} page {} line {}",
                            task.id(),
                            task.learner_id(),
                            advanced.stage,
                            advanced.page,
                            advanced.line
                        );
                        changes
                            .update_position(advanced.clone())
                            .update_task(task)
                            .insert_task(next.clone());
                        report.next_task = Some(next);
                        report.position = Some(advanced);
                    }
                    _ => {
                        tracing::info!(
                            "Task {} passed but the learner's position moved; not advancing",
                            task.id()
                        );
                        changes.update_task(task);
                    }
                }
            }
            TaskProgress::Exhausted { failed } => {
                let live = self.store.get_position(task.learner_id(), task.cohort_id()).await?;
                let aligned = !detect_drift(&task.expected_point(), live.as_ref()).is_drifted();
                if !aligned {
                    // Left without a successor; the reconciler replaces it.
                    tracing::info!(
                        "Task {} failed after the learner's position moved; no remedial task",
                        task.id()
                    );
                    changes.update_task(task);
                    return Ok(report);
                }

                let failed_items = self.failed_items(changes, &task, failed).await?;
                let schedule = self.schedule_for(task.cohort_id()).await?;
                let mut remedial = Task::remedial(&task, failed_items, &schedule, now)?;
                remedial.start(now)?;
                task.link_remedial(remedial.id());

                if let Some(mut position) = live {
                    if task.stage().is_learn() && position.line != remedial.line_range().start {
                        position.line = remedial.line_range().start;
                        changes.update_position(position.clone());
                        report.position = Some(position);
                    }
                }

                tracing::info!(
                    "Task {} failed {} of {}; remedial task {} covers {:?}",
                    task.id(),
                    failed,
                    task.required_count(),
                    remedial.id(),
                    remedial.items()
                );
                report.task = task.clone();
                changes.update_task(task).insert_task(remedial.clone());
                report.next_task = Some(remedial);
            }
        }
        Ok(report)
    }

    /// Items of `task` whose submission did not pass.
    ///
    /// Decisions staged in `changes` take precedence over stored ones. When
    /// outcomes were counted without submission records the failed items
    /// cannot be pinned down, so the trailing `failed` items are used.
    async fn failed_items(
        &self,
        changes: &ChangeSet,
        task: &Task,
        failed: u32,
    ) -> EngineResult<Vec<u32>> {
        let mut submissions = self.store.list_submissions_for_task(task.id()).await?;
        for write in &changes.submissions {
            let staged = write.entity();
            if staged.task_id() != task.id() {
                continue;
            }
            match write {
                Write::Update(_) => {
                    if let Some(existing) = submissions.iter_mut().find(|s| s.id() == staged.id()) {
                        *existing = staged.clone();
                    }
                }
                Write::Insert(_) => submissions.push(staged.clone()),
            }
        }

        let items: Vec<u32> = submissions
            .iter()
            .filter(|s| s.status() == SubmissionStatus::Failed)
            .map(|s| s.item())
            .collect();
        if items.len() == failed as usize {
            return Ok(items);
        }

        let all = task.items();
        let skip = all.len().saturating_sub(failed as usize);
        Ok(all.into_iter().skip(skip).collect())
    }
}
