//! Store wrapper that injects writes and failures at chosen points.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use super::{ChangeSet, InMemoryProgressStore, ProgressStore, StoreError};
use crate::cohort::CohortScheduleConfig;
use crate::curriculum::CurriculumPosition;
use crate::ids::{CohortId, LearnerId, SessionId, SubmissionId, TaskId};
use crate::notify::OutboxEntry;
use crate::session::Session;
use crate::task::{Submission, Task, TaskStatus, VerificationPolicy};

type Hook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

pub(crate) struct InterleavingStore {
    inner: InMemoryProgressStore,
    after_listing_submissions: Mutex<Option<Hook>>,
    reject_commits: AtomicBool,
    commit_attempts: AtomicU32,
}

impl InterleavingStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryProgressStore::new(),
            after_listing_submissions: Mutex::new(None),
            reject_commits: AtomicBool::new(false),
            commit_attempts: AtomicU32::new(0),
        }
    }

    /// The wrapped store; writes through it bypass every hook.
    pub(crate) fn inner(&self) -> &InMemoryProgressStore {
        &self.inner
    }

    /// Run `hook` once, right after the next submission listing was read.
    pub(crate) fn after_next_submission_listing<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Box::new(move || Box::pin(hook()));
        *self.after_listing_submissions.lock().unwrap() = Some(hook);
    }

    /// Fail every commit with a conflict while set.
    pub(crate) fn reject_commits(&self, reject: bool) {
        self.reject_commits.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn commit_attempts(&self) -> u32 {
        self.commit_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressStore for InterleavingStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn get_position(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Option<CurriculumPosition>, StoreError> {
        self.inner.get_position(learner_id, cohort_id).await
    }

    async fn list_enrollments(
        &self,
        active_only: bool,
    ) -> Result<Vec<CurriculumPosition>, StoreError> {
        self.inner.list_enrollments(active_only).await
    }

    async fn upsert_position(
        &self,
        position: &CurriculumPosition,
    ) -> Result<CurriculumPosition, StoreError> {
        self.inner.upsert_position(position).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.get_task(id).await
    }

    async fn find_in_progress_task(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Option<Task>, StoreError> {
        self.inner.find_in_progress_task(learner_id, cohort_id).await
    }

    async fn list_tasks_with_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<Task>, StoreError> {
        self.inner.list_tasks_with_status(status).await
    }

    async fn list_tasks_for_learner(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Vec<Task>, StoreError> {
        self.inner.list_tasks_for_learner(learner_id, cohort_id).await
    }

    async fn get_submission(
        &self,
        id: SubmissionId,
    ) -> Result<Option<Submission>, StoreError> {
        self.inner.get_submission(id).await
    }

    async fn list_submissions_for_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<Submission>, StoreError> {
        let listed = self.inner.list_submissions_for_task(task_id).await?;
        let hook = self.after_listing_submissions.lock().unwrap().take();
        if let Some(hook) = hook {
            hook().await;
        }
        Ok(listed)
    }

    async fn list_pending_submissions(
        &self,
        cohort_id: Option<CohortId>,
    ) -> Result<Vec<Submission>, StoreError> {
        self.inner.list_pending_submissions(cohort_id).await
    }

    async fn get_policy(
        &self,
        cohort_id: CohortId,
    ) -> Result<Option<VerificationPolicy>, StoreError> {
        self.inner.get_policy(cohort_id).await
    }

    async fn put_policy(
        &self,
        cohort_id: CohortId,
        policy: &VerificationPolicy,
    ) -> Result<(), StoreError> {
        self.inner.put_policy(cohort_id, policy).await
    }

    async fn get_schedule(
        &self,
        cohort_id: CohortId,
    ) -> Result<Option<CohortScheduleConfig>, StoreError> {
        self.inner.get_schedule(cohort_id).await
    }

    async fn put_schedule(
        &self,
        cohort_id: CohortId,
        schedule: &CohortScheduleConfig,
    ) -> Result<(), StoreError> {
        self.inner.put_schedule(cohort_id, schedule).await
    }

    async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict("commit rejected".to_string()));
        }
        self.inner.commit(changes).await
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        self.inner.pending_outbox(limit).await
    }

    async fn mark_delivered(&self, ids: &[i64]) -> Result<(), StoreError> {
        self.inner.mark_delivered(ids).await
    }

    async fn get_active_session(
        &self,
        learner_id: LearnerId,
    ) -> Result<Option<Session>, StoreError> {
        self.inner.get_active_session(learner_id).await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        self.inner.get_session(id).await
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.inner.insert_session(session).await
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        self.inner.update_session(session).await
    }
}
