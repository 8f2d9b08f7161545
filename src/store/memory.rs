//! In-memory progress store (non-persistent).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ChangeSet, ProgressStore, StoreError, Write};
use crate::cohort::CohortScheduleConfig;
use crate::curriculum::CurriculumPosition;
use crate::ids::{CohortId, LearnerId, SessionId, SubmissionId, TaskId};
use crate::notify::{OutboxEntry, Notification};
use crate::session::Session;
use crate::task::{Submission, SubmissionStatus, Task, TaskStatus, VerificationPolicy};
use chrono::Utc;

#[derive(Clone, Default)]
struct MemoryState {
    positions: HashMap<(LearnerId, CohortId), CurriculumPosition>,
    tasks: HashMap<TaskId, Task>,
    /// Insertion order of tasks, for stable listing
    task_order: Vec<TaskId>,
    submissions: HashMap<SubmissionId, Submission>,
    policies: HashMap<CohortId, VerificationPolicy>,
    schedules: HashMap<CohortId, CohortScheduleConfig>,
    outbox: Vec<(OutboxEntry, bool)>,
    next_outbox_id: i64,
    sessions: HashMap<SessionId, Session>,
}

impl MemoryState {
    fn in_progress_for(&self, learner_id: LearnerId, cohort_id: CohortId) -> Option<&Task> {
        self.tasks.values().find(|t| {
            t.learner_id == learner_id
                && t.cohort_id == cohort_id
                && t.status == TaskStatus::InProgress
        })
    }

    fn check_single_in_progress(&self, task: &Task) -> Result<(), StoreError> {
        if task.status != TaskStatus::InProgress {
            return Ok(());
        }
        match self.in_progress_for(task.learner_id, task.cohort_id) {
            Some(existing) if existing.id != task.id => Err(StoreError::Conflict(format!(
                "learner {} already has in-progress task {} in cohort {}",
                task.learner_id, existing.id, task.cohort_id
            ))),
            _ => Ok(()),
        }
    }

    fn apply_position(&mut self, position: &CurriculumPosition) -> Result<(), StoreError> {
        let key = (position.learner_id, position.cohort_id);
        let stored = self
            .positions
            .get_mut(&key)
            .ok_or_else(|| StoreError::Missing(format!("enrollment of learner {}", position.learner_id)))?;
        if stored.version != position.version {
            return Err(StoreError::Conflict(format!(
                "position of learner {} changed (version {} != {})",
                position.learner_id, stored.version, position.version
            )));
        }
        let mut next = position.clone();
        next.version += 1;
        *stored = next;
        Ok(())
    }

    fn apply_task(&mut self, write: &Write<Task>) -> Result<(), StoreError> {
        match write {
            Write::Insert(task) => {
                if self.tasks.contains_key(&task.id) {
                    return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
                }
                self.check_single_in_progress(task)?;
                self.tasks.insert(task.id, task.clone());
                self.task_order.push(task.id);
            }
            Write::Update(task) => {
                let stored_version = self
                    .tasks
                    .get(&task.id)
                    .map(|t| t.version)
                    .ok_or_else(|| StoreError::Missing(format!("task {}", task.id)))?;
                if stored_version != task.version {
                    return Err(StoreError::Conflict(format!(
                        "task {} changed (version {} != {})",
                        task.id, stored_version, task.version
                    )));
                }
                self.check_single_in_progress(task)?;
                let mut next = task.clone();
                next.version += 1;
                self.tasks.insert(task.id, next);
            }
        }
        Ok(())
    }

    fn apply_submission(&mut self, write: &Write<Submission>) -> Result<(), StoreError> {
        match write {
            Write::Insert(sub) => {
                let slot_taken = self
                    .submissions
                    .values()
                    .any(|s| s.task_id == sub.task_id && s.slot == sub.slot);
                if slot_taken || self.submissions.contains_key(&sub.id) {
                    return Err(StoreError::Conflict(format!(
                        "slot {} of task {} is already used",
                        sub.slot, sub.task_id
                    )));
                }
                self.submissions.insert(sub.id, sub.clone());
            }
            Write::Update(sub) => {
                let stored_version = self
                    .submissions
                    .get(&sub.id)
                    .map(|s| s.version)
                    .ok_or_else(|| StoreError::Missing(format!("submission {}", sub.id)))?;
                if stored_version != sub.version {
                    return Err(StoreError::Conflict(format!(
                        "submission {} changed (version {} != {})",
                        sub.id, stored_version, sub.version
                    )));
                }
                let mut next = sub.clone();
                next.version += 1;
                self.submissions.insert(sub.id, next);
            }
        }
        Ok(())
    }

    fn push_outbox(&mut self, notification: &Notification) {
        self.next_outbox_id += 1;
        let entry = OutboxEntry {
            id: self.next_outbox_id,
            notification: notification.clone(),
            created_at: Utc::now(),
        };
        self.outbox.push((entry, false));
    }
}

#[derive(Clone)]
pub struct InMemoryProgressStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
        }
    }
}

impl Default for InMemoryProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn get_position(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Option<CurriculumPosition>, StoreError> {
        Ok(self.state.read().await.positions.get(&(learner_id, cohort_id)).cloned())
    }

    async fn list_enrollments(
        &self,
        active_only: bool,
    ) -> Result<Vec<CurriculumPosition>, StoreError> {
        let state = self.state.read().await;
        let mut positions: Vec<CurriculumPosition> = state
            .positions
            .values()
            .filter(|p| !active_only || p.active)
            .cloned()
            .collect();
        positions.sort_by_key(|p| (p.learner_id, p.cohort_id));
        Ok(positions)
    }

    async fn upsert_position(
        &self,
        position: &CurriculumPosition,
    ) -> Result<CurriculumPosition, StoreError> {
        let mut state = self.state.write().await;
        let key = (position.learner_id, position.cohort_id);
        let version = state.positions.get(&key).map(|p| p.version + 1).unwrap_or(0);
        let mut stored = position.clone();
        stored.version = version;
        stored.updated_at = Utc::now();
        state.positions.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn find_in_progress_task(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Option<Task>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .in_progress_for(learner_id, cohort_id)
            .cloned())
    }

    async fn list_tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn list_tasks_for_learner(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.learner_id == learner_id && t.cohort_id == cohort_id)
            .cloned()
            .collect())
    }

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, StoreError> {
        Ok(self.state.read().await.submissions.get(&id).cloned())
    }

    async fn list_submissions_for_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<Submission>, StoreError> {
        let state = self.state.read().await;
        let mut subs: Vec<Submission> = state
            .submissions
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.slot);
        Ok(subs)
    }

    async fn list_pending_submissions(
        &self,
        cohort_id: Option<CohortId>,
    ) -> Result<Vec<Submission>, StoreError> {
        let state = self.state.read().await;
        let mut subs: Vec<Submission> = state
            .submissions
            .values()
            .filter(|s| s.status == SubmissionStatus::Pending)
            .filter(|s| cohort_id.map_or(true, |c| s.cohort_id == c))
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.slot.cmp(&b.slot)));
        Ok(subs)
    }

    async fn get_policy(
        &self,
        cohort_id: CohortId,
    ) -> Result<Option<VerificationPolicy>, StoreError> {
        Ok(self.state.read().await.policies.get(&cohort_id).cloned())
    }

    async fn put_policy(
        &self,
        cohort_id: CohortId,
        policy: &VerificationPolicy,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .policies
            .insert(cohort_id, policy.clone());
        Ok(())
    }

    async fn get_schedule(
        &self,
        cohort_id: CohortId,
    ) -> Result<Option<CohortScheduleConfig>, StoreError> {
        Ok(self.state.read().await.schedules.get(&cohort_id).cloned())
    }

    async fn put_schedule(
        &self,
        cohort_id: CohortId,
        schedule: &CohortScheduleConfig,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .schedules
            .insert(cohort_id, schedule.clone());
        Ok(())
    }

    async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        // Apply to a scratch copy so a failed write leaves nothing behind.
        let mut next = state.clone();

        if let Some(position) = &changes.position {
            next.apply_position(position)?;
        }
        let (updates, inserts): (Vec<_>, Vec<_>) = changes
            .tasks
            .iter()
            .partition(|w| matches!(w, Write::Update(_)));
        for write in updates.into_iter().chain(inserts) {
            next.apply_task(write)?;
        }
        let (updates, inserts): (Vec<_>, Vec<_>) = changes
            .submissions
            .iter()
            .partition(|w| matches!(w, Write::Update(_)));
        for write in updates.into_iter().chain(inserts) {
            next.apply_submission(write)?;
        }
        for notification in &changes.outbox {
            next.push_outbox(notification);
        }

        *state = next;
        Ok(())
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .outbox
            .iter()
            .filter(|(_, delivered)| !delivered)
            .take(limit)
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn mark_delivered(&self, ids: &[i64]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for (entry, delivered) in state.outbox.iter_mut() {
            if ids.contains(&entry.id) {
                *delivered = true;
            }
        }
        Ok(())
    }

    async fn get_active_session(
        &self,
        learner_id: LearnerId,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.learner_id == learner_id && s.active)
            .cloned())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let active_exists = state
            .sessions
            .values()
            .any(|s| s.learner_id == session.learner_id && s.active);
        if session.active && active_exists {
            return Err(StoreError::Conflict(format!(
                "learner {} already has an active session",
                session.learner_id
            )));
        }
        state.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&session.id) {
            Some(stored) => {
                *stored = session.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("session {}", session.id))),
        }
    }
}
