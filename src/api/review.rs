//! Instructor endpoints: review queue, decisions, task detail, overdue report.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;

use super::auth::{AuthUser, Role};
use super::http_error;
use super::routes::AppState;
use super::types::{DecisionRequest, ReviewQuery};
use crate::deadline::OverdueTask;
use crate::error::EngineError;
use crate::ids::{CohortId, LearnerId, SubmissionId, TaskId};
use crate::lifecycle::OutcomeReport;
use crate::task::{Submission, Task};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

pub async fn pending_reviews(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ReviewQuery>,
) -> ApiResult<Vec<Submission>> {
    user.require(Role::Instructor)?;
    state
        .verifier
        .pending_reviews(query.cohort_id)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn decide(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(submission_id): Path<SubmissionId>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<OutcomeReport> {
    user.require(Role::Instructor)?;
    state
        .verifier
        .record_human_decision(submission_id, req.passed, &user.subject)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Task> {
    user.require(Role::Instructor)?;
    state
        .store
        .get_task(task_id)
        .await
        .map_err(|e| http_error(e.into()))?
        .map(Json)
        .ok_or_else(|| http_error(EngineError::NotFound(format!("task {}", task_id))))
}

pub async fn task_submissions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Vec<Submission>> {
    user.require(Role::Instructor)?;
    state
        .store
        .list_submissions_for_task(task_id)
        .await
        .map(Json)
        .map_err(|e| http_error(e.into()))
}

pub async fn task_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((learner_id, cohort_id)): Path<(LearnerId, CohortId)>,
) -> ApiResult<Vec<Task>> {
    user.require(Role::Instructor)?;
    state
        .lifecycle
        .task_history(learner_id, cohort_id)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn overdue(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Vec<OverdueTask>> {
    user.require(Role::Instructor)?;
    state
        .deadlines
        .overdue_report(Utc::now())
        .await
        .map(Json)
        .map_err(http_error)
}
