//! Administrative endpoints: enrollment, position overrides, cancellation,
//! reconciliation, and cohort settings.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};

use super::auth::{AuthUser, Role};
use super::http_error;
use super::routes::AppState;
use super::types::{
    CancelTaskRequest, EnrollRequest, PositionOverrideRequest, PositionOverrideResponse,
};
use crate::cohort::CohortScheduleConfig;
use crate::curriculum::CurriculumPosition;
use crate::ids::{CohortId, LearnerId, TaskId};
use crate::reconcile::ReconcileReport;
use crate::task::{Task, VerificationPolicy};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

async fn apply_override(
    state: &AppState,
    position: CurriculumPosition,
) -> ApiResult<PositionOverrideResponse> {
    let (position, reconcile) = state
        .reconciler
        .apply_position_override(&position)
        .await
        .map_err(http_error)?;
    Ok(Json(PositionOverrideResponse {
        position,
        reconcile,
    }))
}

/// Rewrite a learner's position and repair their tasks before answering.
pub async fn override_position(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((learner_id, cohort_id)): Path<(LearnerId, CohortId)>,
    Json(req): Json<PositionOverrideRequest>,
) -> ApiResult<PositionOverrideResponse> {
    user.require(Role::Admin)?;
    let mut position = CurriculumPosition::new(learner_id, cohort_id, req.page, req.line, req.stage)
        .map_err(|e| http_error(e.into()))?;
    position.active = req.active;
    apply_override(&state, position).await
}

pub async fn enroll(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((learner_id, cohort_id)): Path<(LearnerId, CohortId)>,
    Json(req): Json<EnrollRequest>,
) -> ApiResult<PositionOverrideResponse> {
    user.require(Role::Admin)?;
    let position = CurriculumPosition::start_of_page(learner_id, cohort_id, req.page.unwrap_or(1))
        .map_err(|e| http_error(e.into()))?;
    apply_override(&state, position).await
}

/// Deactivate the enrollment; the learner's open task is cancelled.
pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((learner_id, cohort_id)): Path<(LearnerId, CohortId)>,
) -> ApiResult<PositionOverrideResponse> {
    user.require(Role::Admin)?;
    let mut position = state
        .store
        .get_position(learner_id, cohort_id)
        .await
        .map_err(|e| http_error(e.into()))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Learner is not enrolled".to_string()))?;
    position.active = false;
    apply_override(&state, position).await
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(task_id): Path<TaskId>,
    Json(req): Json<CancelTaskRequest>,
) -> ApiResult<Task> {
    user.require(Role::Admin)?;
    let reason = req
        .reason
        .unwrap_or_else(|| format!("cancelled by {}", user.subject));
    state
        .lifecycle
        .cancel(task_id, &reason)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<ReconcileReport> {
    user.require(Role::Admin)?;
    state.reconciler.run_once().await.map(Json).map_err(http_error)
}

pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(cohort_id): Path<CohortId>,
) -> ApiResult<VerificationPolicy> {
    user.require(Role::Instructor)?;
    state
        .verifier
        .policy_for(cohort_id)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn save_policy(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(cohort_id): Path<CohortId>,
    Json(policy): Json<VerificationPolicy>,
) -> ApiResult<VerificationPolicy> {
    user.require(Role::Admin)?;
    state
        .verifier
        .save_policy(cohort_id, policy)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(cohort_id): Path<CohortId>,
) -> ApiResult<CohortScheduleConfig> {
    user.require(Role::Instructor)?;
    state
        .lifecycle
        .schedule_for(cohort_id)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn save_schedule(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(cohort_id): Path<CohortId>,
    Json(schedule): Json<CohortScheduleConfig>,
) -> ApiResult<CohortScheduleConfig> {
    user.require(Role::Admin)?;
    state
        .verifier
        .save_schedule(cohort_id, schedule)
        .await
        .map(Json)
        .map_err(http_error)
}
