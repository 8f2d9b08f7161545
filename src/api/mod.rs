//! HTTP API for the hifz engine.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/auth/login` - Exchange a role password for a JWT
//! - `GET|PUT /api/learners/{learner}/cohorts/{cohort}/position` - Read or override the position
//! - `POST|DELETE /api/learners/{learner}/cohorts/{cohort}/enrollment` - Enroll or withdraw
//! - `GET|POST /api/learners/{learner}/cohorts/{cohort}/task` - Active task (POST creates it)
//! - `GET /api/learners/{learner}/cohorts/{cohort}/tasks` - Task history
//! - `POST /api/learners/{learner}/cohorts/{cohort}/submissions` - Submit a proof
//! - `POST /api/learners/{learner}/sessions`, `GET .../sessions/active` - Sessions
//! - `PUT /api/sessions/{id}`, `POST /api/sessions/{id}/finish` - Session turns
//! - `GET /api/reviews` - Instructor review queue
//! - `POST /api/submissions/{id}/decision` - Instructor decision
//! - `GET /api/tasks/{id}`, `GET /api/tasks/{id}/submissions` - Task detail
//! - `POST /api/tasks/{id}/cancel` - Cancel a task
//! - `GET /api/overdue` - Overdue report
//! - `POST /api/reconcile` - Run a reconciliation pass
//! - `GET|PUT /api/cohorts/{cohort}/policy`, `GET|PUT /api/cohorts/{cohort}/schedule`

mod admin;
mod auth;
mod learners;
mod review;
mod routes;
pub mod types;

pub use auth::Role;
pub use routes::{router, serve, AppState};
pub use types::*;

use axum::http::StatusCode;

use crate::error::EngineError;

/// Map an engine error onto a status code and message.
pub(crate) fn http_error(error: EngineError) -> (StatusCode, String) {
    let status = match &error {
        EngineError::InvalidState(_) | EngineError::ReconciliationConflict { .. } => {
            StatusCode::CONFLICT
        }
        EngineError::PolicyMisconfiguration(_)
        | EngineError::ScheduleMisconfiguration(_)
        | EngineError::InvalidPosition(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::WriteConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::ExternalScoringUnavailable(_) => StatusCode::BAD_GATEWAY,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", error);
    }
    (status, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scoring::NoScoring;
    use crate::store::InMemoryProgressStore;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app_with(config: Config) -> Router {
        let state = AppState::new(
            config,
            Arc::new(InMemoryProgressStore::new()),
            Arc::new(NoScoring),
        );
        router(Arc::new(state))
    }

    fn dev_app() -> Router {
        app_with(Config::new(PathBuf::from("/tmp/hifz-test")))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json");
        let request = match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn engine_errors_map_to_statuses() {
        assert_eq!(
            http_error(EngineError::InvalidState("x".into())).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            http_error(EngineError::NotFound("x".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            http_error(EngineError::WriteConflict { attempts: 5 }).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            http_error(crate::task::PolicyError::MissingRejectThreshold.into()).0,
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = dev_app();
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["persistent_store"], false);
    }

    #[tokio::test]
    async fn protected_routes_need_a_token() {
        let mut config = Config::new(PathBuf::from("/tmp/hifz-test"));
        config.dev_mode = false;
        config.auth.jwt_secret = Some("secret".to_string());
        config.auth.staff_password = Some("staff-pass".to_string());
        let app = app_with(config);

        let (status, _) = call(&app, "GET", "/api/reviews", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(
            &app,
            "POST",
            "/api/auth/login",
            Some(json!({"role": "instructor", "password": "wrong"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, login) = call(
            &app,
            "POST",
            "/api/auth/login",
            Some(json!({"role": "instructor", "password": "staff-pass", "name": "musa"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = login["token"].as_str().unwrap().to_string();

        let request = |uri: &str, method: &str| {
            Request::builder()
                .method(method)
                .uri(uri)
                .header("Authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(request("/api/reviews", "GET")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Instructors cannot run administrative actions.
        let response = app.clone().oneshot(request("/api/reconcile", "POST")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn learner_flow_over_http() {
        let app = dev_app();
        let learner = crate::ids::LearnerId::new();
        let cohort = crate::ids::CohortId::new();
        let base = format!("/api/learners/{}/cohorts/{}", learner, cohort);

        let (status, _) = call(&app, "GET", &format!("{}/task", base), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, position) = call(
            &app,
            "POST",
            &format!("{}/enrollment", base),
            Some(json!({"page": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(position["position"]["page"], 4);
        assert_eq!(position["position"]["stage"], "S1_LEARN");

        let (status, task) = call(&app, "POST", &format!("{}/task", base), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["required_count"], 7);
        let task_id = task["id"].as_str().unwrap().to_string();

        let (status, submitted) = call(
            &app,
            "POST",
            &format!("{}/submissions", base),
            Some(json!({"proof_kind": "audio", "proof_ref": "note-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(submitted["decision"], "PENDING_HUMAN");
        assert_eq!(submitted["learner_message"], "Recorded, awaiting review");
        let submission_id = submitted["submission"]["id"].as_str().unwrap().to_string();

        let (status, queue) = call(
            &app,
            "GET",
            &format!("/api/reviews?cohort_id={}", cohort),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(queue.as_array().unwrap().len(), 1);

        let decision_uri = format!("/api/submissions/{}/decision", submission_id);
        let (status, report) =
            call(&app, "POST", &decision_uri, Some(json!({"passed": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["task"]["passed_count"], 1);

        let (status, _) = call(&app, "POST", &decision_uri, Some(json!({"passed": false}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, cancelled) = call(
            &app,
            "POST",
            &format!("/api/tasks/{}/cancel", task_id),
            Some(json!({"reason": "testing"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "CANCELLED");
    }

    #[tokio::test]
    async fn position_override_reconciles_before_returning() {
        let app = dev_app();
        let learner = crate::ids::LearnerId::new();
        let cohort = crate::ids::CohortId::new();
        let base = format!("/api/learners/{}/cohorts/{}", learner, cohort);

        call(&app, "POST", &format!("{}/enrollment", base), Some(json!({}))).await;
        let (_, old) = call(&app, "POST", &format!("{}/task", base), None).await;

        let (status, body) = call(
            &app,
            "PUT",
            &format!("{}/position", base),
            Some(json!({"page": 9, "line": 8, "stage": "S2_REVIEW"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reconcile"]["cancelled"][0], old["id"]);
        assert_eq!(body["reconcile"]["recreated"].as_array().unwrap().len(), 1);

        let (_, task) = call(&app, "GET", &format!("{}/task", base), None).await;
        assert_eq!(task["stage"], "S2_REVIEW");
        assert_eq!(task["page_ref"], 9);

        let (status, _) = call(
            &app,
            "PUT",
            &format!("{}/position", base),
            Some(json!({"page": 9, "line": 2, "stage": "S2_REVIEW"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, report) = call(&app, "POST", "/api/reconcile", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(report["cancelled"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn policy_validation_is_422() {
        let app = dev_app();
        let cohort = crate::ids::CohortId::new();
        let uri = format!("/api/cohorts/{}/policy", cohort);
        let (status, _) = call(
            &app,
            "PUT",
            &uri,
            Some(json!({
                "ai_provider": "A",
                "mode": "FULL_AUTO",
                "accept_threshold": 60,
                "reject_threshold": 70
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, policy) = call(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(policy["mode"], "MANUAL");
    }
}
