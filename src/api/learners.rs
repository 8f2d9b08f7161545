//! Learner-facing endpoints used by the chat front-end.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};

use super::auth::{AuthUser, Role};
use super::http_error;
use super::routes::AppState;
use super::types::{StartSessionRequest, SubmitProofRequest, UpdateSessionRequest};
use crate::curriculum::CurriculumPosition;
use crate::ids::{CohortId, LearnerId, SessionId};
use crate::session::Session;
use crate::task::Task;
use crate::util::non_blank;
use crate::verifier::{ProofUpload, SubmitOutcome};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

pub async fn get_position(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((learner_id, cohort_id)): Path<(LearnerId, CohortId)>,
) -> ApiResult<CurriculumPosition> {
    user.require(Role::Bot)?;
    let position = state
        .store
        .get_position(learner_id, cohort_id)
        .await
        .map_err(|e| http_error(e.into()))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Learner is not enrolled".to_string()))?;
    Ok(Json(position))
}

/// The learner's current task, without creating one.
pub async fn get_active_task(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((learner_id, cohort_id)): Path<(LearnerId, CohortId)>,
) -> ApiResult<Task> {
    user.require(Role::Bot)?;
    let task = state
        .lifecycle
        .active_task(learner_id, cohort_id)
        .await
        .map_err(http_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No active task".to_string()))?;
    Ok(Json(task))
}

/// The learner's current task, created from the position if needed.
pub async fn ensure_task(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((learner_id, cohort_id)): Path<(LearnerId, CohortId)>,
) -> ApiResult<Task> {
    user.require(Role::Bot)?;
    state
        .lifecycle
        .ensure_active_task(learner_id, cohort_id)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((learner_id, cohort_id)): Path<(LearnerId, CohortId)>,
    Json(req): Json<SubmitProofRequest>,
) -> ApiResult<SubmitOutcome> {
    user.require(Role::Bot)?;
    let proof_ref = non_blank(&req.proof_ref)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "proof_ref is required".to_string()))?;
    let upload = ProofUpload {
        proof_kind: req.proof_kind,
        proof_ref,
        reference_text: req.reference_text,
    };
    state
        .verifier
        .submit(learner_id, cohort_id, upload)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(learner_id): Path<LearnerId>,
    Json(req): Json<StartSessionRequest>,
) -> ApiResult<Session> {
    user.require(Role::Bot)?;
    state
        .sessions
        .start(learner_id, req.kind, req.state)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn active_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(learner_id): Path<LearnerId>,
) -> ApiResult<Session> {
    user.require(Role::Bot)?;
    state
        .sessions
        .current(learner_id)
        .await
        .map_err(http_error)?
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No active session".to_string()))
}

pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<SessionId>,
    Json(req): Json<UpdateSessionRequest>,
) -> ApiResult<Session> {
    user.require(Role::Bot)?;
    state
        .sessions
        .update(id, req.state)
        .await
        .map(Json)
        .map_err(http_error)
}

pub async fn finish_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<SessionId>,
) -> ApiResult<Session> {
    user.require(Role::Bot)?;
    state.sessions.finish(id).await.map(Json).map_err(http_error)
}
