//! Overdue tracking. Reporting only: nothing here changes a task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::cohort::CohortScheduleConfig;
use crate::curriculum::Stage;
use crate::error::EngineResult;
use crate::ids::{CohortId, LearnerId, TaskId};
use crate::lifecycle::TaskLifecycleManager;
use crate::store::ProgressStore;
use crate::task::{Task, TaskStatus};

/// Whether `task` is past its deadline.
///
/// Tasks created while deadlines were off carry no deadline and are never
/// overdue, and switching deadlines off for a cohort hides existing ones.
pub fn is_overdue(task: &Task, schedule: &CohortScheduleConfig, now: DateTime<Utc>) -> bool {
    schedule.deadlines_enabled && task.deadline().is_some_and(|deadline| now > deadline)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverdueTask {
    pub task_id: TaskId,
    pub learner_id: LearnerId,
    pub cohort_id: CohortId,
    pub stage: Stage,
    pub page: u32,
    pub deadline: DateTime<Utc>,
    pub overdue_hours: i64,
}

pub struct DeadlineTracker {
    store: Arc<dyn ProgressStore>,
    lifecycle: Arc<TaskLifecycleManager>,
}

impl DeadlineTracker {
    pub fn new(store: Arc<dyn ProgressStore>, lifecycle: Arc<TaskLifecycleManager>) -> Self {
        Self { store, lifecycle }
    }

    /// Every overdue IN_PROGRESS task, most overdue first.
    pub async fn overdue_report(&self, now: DateTime<Utc>) -> EngineResult<Vec<OverdueTask>> {
        let mut overdue = Vec::new();
        for task in self.store.list_tasks_with_status(TaskStatus::InProgress).await? {
            let schedule = self.lifecycle.schedule_for(task.cohort_id()).await?;
            if !is_overdue(&task, &schedule, now) {
                continue;
            }
            let Some(deadline) = task.deadline() else {
                continue;
            };
            overdue.push(OverdueTask {
                task_id: task.id(),
                learner_id: task.learner_id(),
                cohort_id: task.cohort_id(),
                stage: task.stage(),
                page: task.page_ref(),
                deadline,
                overdue_hours: (now - deadline).num_hours(),
            });
        }
        overdue.sort_by_key(|t| t.deadline);
        Ok(overdue)
    }
}
