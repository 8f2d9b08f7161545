//! Progress storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database, one transaction per change set
//!
//! All engine state changes go through [`ProgressStore::commit`]. A change set
//! is applied atomically: either every write lands or none does. Updates are
//! versioned; an update whose stored version differs from the version it was
//! read at fails with [`StoreError::Conflict`] and the caller re-reads.

mod memory;
mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::InMemoryProgressStore;
pub use sqlite::SqliteProgressStore;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cohort::CohortScheduleConfig;
use crate::curriculum::CurriculumPosition;
use crate::ids::{CohortId, LearnerId, SessionId, SubmissionId, TaskId};
use crate::notify::{Notification, OutboxEntry};
use crate::session::Session;
use crate::task::{Submission, Task, TaskStatus, VerificationPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A versioned write lost a race, or a uniqueness rule was violated.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    Missing(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// One entity write inside a [`ChangeSet`].
#[derive(Debug, Clone, PartialEq)]
pub enum Write<T> {
    Insert(T),
    /// Versioned update; the entity carries the version it was read at.
    Update(T),
}

impl<T> Write<T> {
    pub fn entity(&self) -> &T {
        match self {
            Write::Insert(entity) | Write::Update(entity) => entity,
        }
    }
}

/// Everything one engine operation writes, applied in a single transaction.
///
/// Apply order: position, task updates, task inserts, submission updates,
/// submission inserts, outbox. Task updates land before inserts so that
/// closing one task and opening its successor never trips the
/// one-in-progress-task rule.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub position: Option<CurriculumPosition>,
    pub tasks: Vec<Write<Task>>,
    pub submissions: Vec<Write<Submission>>,
    pub outbox: Vec<Notification>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&mut self, task: Task) -> &mut Self {
        self.tasks.push(Write::Insert(task));
        self
    }

    pub fn update_task(&mut self, task: Task) -> &mut Self {
        self.tasks.push(Write::Update(task));
        self
    }

    pub fn insert_submission(&mut self, submission: Submission) -> &mut Self {
        self.submissions.push(Write::Insert(submission));
        self
    }

    pub fn update_submission(&mut self, submission: Submission) -> &mut Self {
        self.submissions.push(Write::Update(submission));
        self
    }

    pub fn update_position(&mut self, position: CurriculumPosition) -> &mut Self {
        self.position = Some(position);
        self
    }

    pub fn notify(&mut self, notification: Notification) -> &mut Self {
        self.outbox.push(notification);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.tasks.is_empty()
            && self.submissions.is_empty()
            && self.outbox.is_empty()
    }

    /// The writes as they look once committed (updated rows carry the bumped version).
    pub fn committed(mut self) -> ChangeSet {
        if let Some(position) = self.position.as_mut() {
            position.version += 1;
        }
        for write in &mut self.tasks {
            if let Write::Update(task) = write {
                task.version += 1;
            }
        }
        for write in &mut self.submissions {
            if let Write::Update(submission) = write {
                submission.version += 1;
            }
        }
        self
    }
}

/// Progress store trait - implemented by all storage backends.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    // Positions

    async fn get_position(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Option<CurriculumPosition>, StoreError>;

    /// List enrollments, optionally only the active ones.
    async fn list_enrollments(&self, active_only: bool)
        -> Result<Vec<CurriculumPosition>, StoreError>;

    /// Unversioned write used by enrollment and administrative overrides.
    ///
    /// Returns the stored position with its new version.
    async fn upsert_position(
        &self,
        position: &CurriculumPosition,
    ) -> Result<CurriculumPosition, StoreError>;

    // Tasks

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn find_in_progress_task(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Option<Task>, StoreError>;

    async fn list_tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError>;

    /// All tasks of one enrollment, oldest first.
    async fn list_tasks_for_learner(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Vec<Task>, StoreError>;

    // Submissions

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, StoreError>;

    /// Submissions of a task ordered by slot.
    async fn list_submissions_for_task(&self, task_id: TaskId)
        -> Result<Vec<Submission>, StoreError>;

    /// The instructor review queue, oldest first.
    async fn list_pending_submissions(
        &self,
        cohort_id: Option<CohortId>,
    ) -> Result<Vec<Submission>, StoreError>;

    // Cohort settings

    async fn get_policy(&self, cohort_id: CohortId)
        -> Result<Option<VerificationPolicy>, StoreError>;

    async fn put_policy(
        &self,
        cohort_id: CohortId,
        policy: &VerificationPolicy,
    ) -> Result<(), StoreError>;

    async fn get_schedule(
        &self,
        cohort_id: CohortId,
    ) -> Result<Option<CohortScheduleConfig>, StoreError>;

    async fn put_schedule(
        &self,
        cohort_id: CohortId,
        schedule: &CohortScheduleConfig,
    ) -> Result<(), StoreError>;

    // Transactions

    /// Apply a change set atomically.
    async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError>;

    // Outbox

    /// Undelivered notifications, oldest first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    async fn mark_delivered(&self, ids: &[i64]) -> Result<(), StoreError>;

    // Sessions

    async fn get_active_session(&self, learner_id: LearnerId)
        -> Result<Option<Session>, StoreError>;

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Insert a session; `Conflict` when the learner already has an active one.
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;
}

/// Store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    Memory,
    #[default]
    Sqlite,
}

impl std::str::FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreType::Memory),
            "sqlite" => Ok(StoreType::Sqlite),
            other => Err(format!("Unknown store type: {}", other)),
        }
    }
}

/// Create a progress store of the given type.
pub async fn create_progress_store(
    store_type: StoreType,
    data_dir: PathBuf,
) -> Result<Arc<dyn ProgressStore>, StoreError> {
    match store_type {
        StoreType::Memory => Ok(Arc::new(InMemoryProgressStore::new())),
        StoreType::Sqlite => {
            let store = SqliteProgressStore::new(data_dir).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::CohortScheduleConfig;
    use crate::curriculum::Stage;
    use chrono::Utc;

    #[test]
    fn store_type_parses_case_insensitively() {
        assert_eq!("SQLite".parse::<StoreType>().unwrap(), StoreType::Sqlite);
        assert_eq!("memory".parse::<StoreType>().unwrap(), StoreType::Memory);
        assert!("file".parse::<StoreType>().is_err());
    }

    #[test]
    fn committed_bumps_only_updated_rows() {
        let position =
            CurriculumPosition::new(LearnerId::new(), CohortId::new(), 1, 1, Stage::S1Learn)
                .unwrap();
        let task = Task::for_position(&position, &CohortScheduleConfig::default(), Utc::now());
        let mut changes = ChangeSet::new();
        changes
            .update_task(task.clone())
            .insert_task(task)
            .update_position(position);
        let committed = changes.committed();
        assert_eq!(committed.tasks[0].entity().version(), 1);
        assert_eq!(committed.tasks[1].entity().version(), 0);
        assert_eq!(committed.position.map(|p| p.version), Some(1));
    }
}
