//! Orphan reconciliation.
//!
//! A task is orphaned when the position it was planned for no longer matches
//! the learner's live position, usually after an administrator moved the
//! learner or a job crashed between writes. Each pass cancels orphans and
//! plans fresh tasks through the lifecycle manager, so running it twice in a
//! row changes nothing the second time.

mod drift;

pub use drift::{detect_drift, Drift};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::curriculum::CurriculumPosition;
use crate::error::{EngineError, EngineResult};
use crate::ids::{CohortId, LearnerId, TaskId};
use crate::lifecycle::{ReplaceOutcome, TaskLifecycleManager};
use crate::store::ProgressStore;
use crate::task::{Task, TaskStatus};

const STALE_REASON: &str = "stale position";

/// A task left alone because it still holds unreviewed submissions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlaggedTask {
    pub task_id: TaskId,
    pub learner_id: LearnerId,
    pub cohort_id: CohortId,
    pub pending_submissions: usize,
    pub drift: Drift,
}

/// An active enrollment without an IN_PROGRESS task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdleEnrollment {
    pub learner_id: LearnerId,
    pub cohort_id: CohortId,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub cancelled: Vec<TaskId>,
    pub recreated: Vec<TaskId>,
    pub flagged: Vec<FlaggedTask>,
    pub idle: Vec<IdleEnrollment>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.cancelled.is_empty() && self.recreated.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} cancelled, {} recreated, {} flagged, {} idle",
            self.cancelled.len(),
            self.recreated.len(),
            self.flagged.len(),
            self.idle.len()
        )
    }
}

fn is_candidate(task: &Task) -> bool {
    match task.status() {
        TaskStatus::InProgress => true,
        TaskStatus::Failed => task.remedial_task_id().is_none(),
        TaskStatus::PendingStart | TaskStatus::Passed | TaskStatus::Cancelled => false,
    }
}

pub struct OrphanReconciler {
    store: Arc<dyn ProgressStore>,
    lifecycle: Arc<TaskLifecycleManager>,
}

impl OrphanReconciler {
    pub fn new(store: Arc<dyn ProgressStore>, lifecycle: Arc<TaskLifecycleManager>) -> Self {
        Self { store, lifecycle }
    }

    /// Tasks that can still be orphaned: open ones, and failed ones whose
    /// remedial successor was never created.
    async fn candidates(&self) -> EngineResult<Vec<Task>> {
        let mut tasks = self.store.list_tasks_with_status(TaskStatus::InProgress).await?;
        tasks.extend(
            self.store
                .list_tasks_with_status(TaskStatus::Failed)
                .await?
                .into_iter()
                .filter(is_candidate),
        );
        Ok(tasks)
    }

    /// One full pass over every candidate task.
    pub async fn run_once(&self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for task in self.candidates().await? {
            self.reconcile_task(&task, &mut report).await;
        }

        for position in self.store.list_enrollments(true).await? {
            if self
                .store
                .find_in_progress_task(position.learner_id, position.cohort_id)
                .await?
                .is_none()
            {
                report.idle.push(IdleEnrollment {
                    learner_id: position.learner_id,
                    cohort_id: position.cohort_id,
                });
            }
        }

        if report.is_noop() && report.flagged.is_empty() {
            tracing::debug!("Reconciliation pass: {}", report.summary());
        } else {
            tracing::info!("Reconciliation pass: {}", report.summary());
        }
        Ok(report)
    }

    /// Reconcile a single enrollment.
    pub async fn reconcile_learner(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let tasks = self.store.list_tasks_for_learner(learner_id, cohort_id).await?;
        for task in tasks.iter().filter(|t| is_candidate(t)) {
            self.reconcile_task(task, &mut report).await;
        }

        let active = matches!(
            self.store.get_position(learner_id, cohort_id).await?,
            Some(ref position) if position.active
        );
        if active
            && self
                .store
                .find_in_progress_task(learner_id, cohort_id)
                .await?
                .is_none()
        {
            report.idle.push(IdleEnrollment {
                learner_id,
                cohort_id,
            });
        }
        Ok(report)
    }

    /// Administrative position override: rewrite the position, then repair the
    /// learner's tasks before returning.
    pub async fn apply_position_override(
        &self,
        position: &CurriculumPosition,
    ) -> EngineResult<(CurriculumPosition, ReconcileReport)> {
        let stored = self.store.upsert_position(position).await?;
        tracing::info!(
            "Position override for learner {} in cohort {}: page {} line {} {} (active: {})",
            stored.learner_id,
            stored.cohort_id,
            stored.page,
            stored.line,
            stored.stage,
            stored.active
        );
        let report = self
            .reconcile_learner(stored.learner_id, stored.cohort_id)
            .await?;
        Ok((stored, report))
    }

    async fn reconcile_task(&self, task: &Task, report: &mut ReconcileReport) {
        let live = match self.store.get_position(task.learner_id(), task.cohort_id()).await {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!("Reconciler could not read position for task {}: {}", task.id(), e);
                return;
            }
        };
        let drift = detect_drift(&task.expected_point(), live.as_ref());
        if !drift.is_drifted() {
            return;
        }

        match self.lifecycle.replace_stale_task(task.id(), STALE_REASON).await {
            Ok(ReplaceOutcome::Replaced { cancelled, recreated }) => {
                tracing::info!("Cancelled orphaned task {} ({:?})", cancelled.id(), drift);
                report.cancelled.push(cancelled.id());
                if let Some(fresh) = recreated {
                    report.recreated.push(fresh.id());
                }
            }
            // Closed by a concurrent pass or submission.
            Ok(ReplaceOutcome::Skipped) => {}
            Err(EngineError::ReconciliationConflict { task_id, pending }) => {
                tracing::warn!(
                    "Orphaned task {} holds {} unreviewed submissions; flagged",
                    task_id,
                    pending
                );
                report.flagged.push(FlaggedTask {
                    task_id,
                    learner_id: task.learner_id(),
                    cohort_id: task.cohort_id(),
                    pending_submissions: pending,
                    drift,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to replace orphaned task {}: {}", task.id(), e);
            }
        }
    }

    /// Run a pass on an interval until the process exits.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Orphan reconciler started (every {:?})", interval);
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.run_once().await {
                    tracing::warn!("Reconciliation pass failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::CohortScheduleConfig;
    use crate::curriculum::Stage;
    use crate::lifecycle::SubmissionDraft;
    use crate::store::testing::InterleavingStore;
    use crate::store::{InMemoryProgressStore, SqliteProgressStore};
    use crate::task::{Decision, ProofKind, SubmissionStatus};

    struct Fixture {
        store: Arc<InMemoryProgressStore>,
        lifecycle: Arc<TaskLifecycleManager>,
        reconciler: OrphanReconciler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryProgressStore::new());
        let lifecycle = Arc::new(TaskLifecycleManager::new(
            store.clone(),
            CohortScheduleConfig::default(),
            5,
        ));
        let reconciler = OrphanReconciler::new(store.clone(), lifecycle.clone());
        Fixture {
            store,
            lifecycle,
            reconciler,
        }
    }

    async fn enroll(f: &Fixture, page: u32) -> CurriculumPosition {
        let position = CurriculumPosition::start_of_page(LearnerId::new(), CohortId::new(), page)
            .unwrap();
        f.store.upsert_position(&position).await.unwrap()
    }

    #[tokio::test]
    async fn aligned_tasks_are_untouched_and_idle_enrollments_reported() {
        let f = fixture();
        let busy = enroll(&f, 1).await;
        let idle = enroll(&f, 2).await;
        f.lifecycle
            .ensure_active_task(busy.learner_id, busy.cohort_id)
            .await
            .unwrap();

        let report = f.reconciler.run_once().await.unwrap();
        assert!(report.is_noop());
        assert_eq!(
            report.idle,
            vec![IdleEnrollment {
                learner_id: idle.learner_id,
                cohort_id: idle.cohort_id
            }]
        );
    }

    #[tokio::test]
    async fn override_replaces_task_exactly_once() {
        let f = fixture();
        let position = enroll(&f, 3).await;
        let old = f
            .lifecycle
            .ensure_active_task(position.learner_id, position.cohort_id)
            .await
            .unwrap();

        let mut moved = position.clone();
        moved.page = 12;
        let (stored, report) = f.reconciler.apply_position_override(&moved).await.unwrap();
        assert_eq!(stored.page, 12);
        assert_eq!(report.cancelled, vec![old.id()]);
        assert_eq!(report.recreated.len(), 1);

        let tasks = f
            .lifecycle
            .task_history(position.learner_id, position.cohort_id)
            .await
            .unwrap();
        let open: Vec<_> = tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::InProgress)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].page_ref(), 12);
        let cancelled = tasks.iter().find(|t| t.id() == old.id()).unwrap();
        assert_eq!(cancelled.status(), TaskStatus::Cancelled);

        let second = f.reconciler.run_once().await.unwrap();
        assert!(second.is_noop());
        assert!(second.flagged.is_empty());
    }

    #[tokio::test]
    async fn withdrawn_learner_task_is_cancelled_without_replacement() {
        let f = fixture();
        let position = enroll(&f, 1).await;
        let task = f
            .lifecycle
            .ensure_active_task(position.learner_id, position.cohort_id)
            .await
            .unwrap();

        let mut withdrawn = position.clone();
        withdrawn.active = false;
        let (_, report) = f.reconciler.apply_position_override(&withdrawn).await.unwrap();
        assert_eq!(report.cancelled, vec![task.id()]);
        assert!(report.recreated.is_empty());
        assert!(report.idle.is_empty());
    }

    #[tokio::test]
    async fn tasks_with_pending_reviews_are_flagged() {
        let f = fixture();
        let position = enroll(&f, 5).await;
        let recorded = f
            .lifecycle
            .record_submission(
                position.learner_id,
                position.cohort_id,
                SubmissionDraft {
                    proof_kind: ProofKind::Video,
                    proof_ref: "clip".to_string(),
                    ai_score: None,
                    for_task: None,
                },
                Decision::PendingHuman,
            )
            .await
            .unwrap();

        let mut moved = position.clone();
        moved.stage = Stage::Consolidate;
        f.store.upsert_position(&moved).await.unwrap();

        let report = f.reconciler.run_once().await.unwrap();
        assert!(report.cancelled.is_empty());
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].task_id, recorded.submission.task_id());
        assert_eq!(report.flagged[0].pending_submissions, 1);

        // Once reviewed the task can be repaired.
        f.lifecycle
            .settle_submission(recorded.submission.id(), true, Some("reviewer"))
            .await
            .unwrap();
        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.cancelled, vec![recorded.submission.task_id()]);
        let active = f
            .lifecycle
            .active_task(position.learner_id, position.cohort_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.stage(), Stage::Consolidate);
    }

    fn clip() -> SubmissionDraft {
        SubmissionDraft {
            proof_kind: ProofKind::Audio,
            proof_ref: "clip".to_string(),
            ai_score: None,
            for_task: None,
        }
    }

    #[tokio::test]
    async fn submission_landing_mid_pass_keeps_task_open() {
        let store = Arc::new(InterleavingStore::new());
        let lifecycle = Arc::new(TaskLifecycleManager::new(
            store.clone(),
            CohortScheduleConfig::default(),
            5,
        ));
        let reconciler = OrphanReconciler::new(store.clone(), lifecycle.clone());

        let position = CurriculumPosition::start_of_page(LearnerId::new(), CohortId::new(), 5)
            .unwrap();
        let (learner, cohort) = (position.learner_id, position.cohort_id);
        store.upsert_position(&position).await.unwrap();
        let task = lifecycle.ensure_active_task(learner, cohort).await.unwrap();

        let mut moved = position.clone();
        moved.stage = Stage::Consolidate;
        store.upsert_position(&moved).await.unwrap();
        // A second writer that bypasses the hook records a proof while the
        // pass is between its pending check and its commit.
        let side = Arc::new(TaskLifecycleManager::new(
            Arc::new(store.inner().clone()),
            CohortScheduleConfig::default(),
            5,
        ));
        store.after_next_submission_listing(move || async move {
            side.record_submission(learner, cohort, clip(), Decision::PendingHuman)
                .await
                .unwrap();
        });

        let report = reconciler.run_once().await.unwrap();
        assert!(report.cancelled.is_empty());
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].pending_submissions, 1);

        let stored = store.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::InProgress);
        let submissions = store.list_submissions_for_task(task.id()).await.unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].status(), SubmissionStatus::Pending);
    }

    async fn assert_single_open_task(
        store: &dyn ProgressStore,
        learner: LearnerId,
        cohort: CohortId,
    ) -> Task {
        let open: Vec<Task> = store
            .list_tasks_for_learner(learner, cohort)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.status() == TaskStatus::InProgress)
            .collect();
        assert_eq!(open.len(), 1);
        open.into_iter().next().unwrap()
    }

    async fn concurrent_passes_replace_once(store: Arc<dyn ProgressStore>) {
        let lifecycle = Arc::new(TaskLifecycleManager::new(
            store.clone(),
            CohortScheduleConfig::default(),
            20,
        ));
        let reconciler = Arc::new(OrphanReconciler::new(store.clone(), lifecycle.clone()));

        let position = CurriculumPosition::start_of_page(LearnerId::new(), CohortId::new(), 2)
            .unwrap();
        let (learner, cohort) = (position.learner_id, position.cohort_id);
        store.upsert_position(&position).await.unwrap();
        let old = lifecycle.ensure_active_task(learner, cohort).await.unwrap();

        let mut moved = store.get_position(learner, cohort).await.unwrap().unwrap();
        moved.page = 8;
        store.upsert_position(&moved).await.unwrap();

        let passes: Vec<_> = (0..4)
            .map(|_| {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.run_once().await })
            })
            .collect();
        let mut cancelled = Vec::new();
        let mut recreated = Vec::new();
        for pass in passes {
            let report = pass.await.unwrap().unwrap();
            cancelled.extend(report.cancelled);
            recreated.extend(report.recreated);
        }

        assert_eq!(cancelled, vec![old.id()]);
        assert_eq!(recreated.len(), 1);
        let open = assert_single_open_task(store.as_ref(), learner, cohort).await;
        assert_eq!(open.id(), recreated[0]);
        assert_eq!(open.page_ref(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_passes_replace_once_in_memory() {
        concurrent_passes_replace_once(Arc::new(InMemoryProgressStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_passes_replace_once_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteProgressStore::new(dir.path().to_path_buf()).await.unwrap();
        concurrent_passes_replace_once(Arc::new(store)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submissions_racing_a_pass_are_never_orphaned() {
        let store: Arc<dyn ProgressStore> = Arc::new(InMemoryProgressStore::new());
        let lifecycle = Arc::new(TaskLifecycleManager::new(
            store.clone(),
            CohortScheduleConfig::default(),
            20,
        ));
        let reconciler = Arc::new(OrphanReconciler::new(store.clone(), lifecycle.clone()));

        let position = CurriculumPosition::start_of_page(LearnerId::new(), CohortId::new(), 6)
            .unwrap();
        let (learner, cohort) = (position.learner_id, position.cohort_id);
        store.upsert_position(&position).await.unwrap();
        lifecycle.ensure_active_task(learner, cohort).await.unwrap();
        let mut moved = store.get_position(learner, cohort).await.unwrap().unwrap();
        moved.stage = Stage::S1Review;
        store.upsert_position(&moved).await.unwrap();

        let submitting = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    lifecycle
                        .record_submission(learner, cohort, clip(), Decision::PendingHuman)
                        .await
                        .unwrap();
                }
            })
        };
        let reconciling = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run_once().await })
        };
        submitting.await.unwrap();
        reconciling.await.unwrap().unwrap();

        for task in store.list_tasks_for_learner(learner, cohort).await.unwrap() {
            let pending = store
                .list_submissions_for_task(task.id())
                .await
                .unwrap()
                .iter()
                .filter(|s| s.status() == SubmissionStatus::Pending)
                .count();
            if pending > 0 {
                assert_eq!(task.status(), TaskStatus::InProgress);
            }
        }
        assert_single_open_task(store.as_ref(), learner, cohort).await;
    }

    #[tokio::test]
    async fn override_only_touches_that_learner() {
        let f = fixture();
        let first = enroll(&f, 1).await;
        let second = enroll(&f, 1).await;
        let untouched = f
            .lifecycle
            .ensure_active_task(second.learner_id, second.cohort_id)
            .await
            .unwrap();
        f.lifecycle
            .ensure_active_task(first.learner_id, first.cohort_id)
            .await
            .unwrap();

        let mut drifted = second.clone();
        drifted.page = 4;
        f.store.upsert_position(&drifted).await.unwrap();

        let mut moved = first.clone();
        moved.page = 3;
        let (_, report) = f.reconciler.apply_position_override(&moved).await.unwrap();
        assert_eq!(report.cancelled.len(), 1);
        let still_open = f.store.get_task(untouched.id()).await.unwrap().unwrap();
        assert_eq!(still_open.status(), TaskStatus::InProgress);
    }
}
