//! HTTP router, shared state, and server bootstrap.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::{
    extract::State,
    response::Json,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::deadline::DeadlineTracker;
use crate::lifecycle::TaskLifecycleManager;
use crate::notify::{LogNotifier, Notifier, OutboxDispatcher, WebhookNotifier};
use crate::reconcile::OrphanReconciler;
use crate::scoring::{HttpScoringClient, NoScoring, ScoringClient};
use crate::session::SessionManager;
use crate::store::{create_progress_store, ProgressStore};
use crate::verifier::SubmissionVerifier;

use super::admin;
use super::auth;
use super::learners;
use super::review;
use super::types::HealthResponse;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ProgressStore>,
    pub lifecycle: Arc<TaskLifecycleManager>,
    pub verifier: SubmissionVerifier,
    pub reconciler: Arc<OrphanReconciler>,
    pub deadlines: DeadlineTracker,
    pub sessions: SessionManager,
}

impl AppState {
    /// Wire the engine components around one store.
    pub fn new(config: Config, store: Arc<dyn ProgressStore>, scoring: Arc<dyn ScoringClient>) -> Self {
        let lifecycle = Arc::new(TaskLifecycleManager::new(
            Arc::clone(&store),
            config.default_schedule.clone(),
            config.max_write_retries,
        ));
        Self {
            verifier: SubmissionVerifier::new(Arc::clone(&store), Arc::clone(&lifecycle), scoring),
            reconciler: Arc::new(OrphanReconciler::new(
                Arc::clone(&store),
                Arc::clone(&lifecycle),
            )),
            deadlines: DeadlineTracker::new(Arc::clone(&store), Arc::clone(&lifecycle)),
            sessions: SessionManager::new(Arc::clone(&store)),
            lifecycle,
            store,
            config,
        }
    }
}

/// Build the router over an existing state.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth::login));

    let protected_routes = Router::new()
        // Learner-facing (chat front-end)
        .route(
            "/api/learners/:learner/cohorts/:cohort/position",
            get(learners::get_position).put(admin::override_position),
        )
        .route(
            "/api/learners/:learner/cohorts/:cohort/enrollment",
            post(admin::enroll).delete(admin::withdraw),
        )
        .route(
            "/api/learners/:learner/cohorts/:cohort/task",
            get(learners::get_active_task).post(learners::ensure_task),
        )
        .route(
            "/api/learners/:learner/cohorts/:cohort/tasks",
            get(review::task_history),
        )
        .route(
            "/api/learners/:learner/cohorts/:cohort/submissions",
            post(learners::submit),
        )
        .route(
            "/api/learners/:learner/sessions",
            post(learners::start_session),
        )
        .route(
            "/api/learners/:learner/sessions/active",
            get(learners::active_session),
        )
        .route("/api/sessions/:id", put(learners::update_session))
        .route("/api/sessions/:id/finish", post(learners::finish_session))
        // Instructor review
        .route("/api/reviews", get(review::pending_reviews))
        .route("/api/submissions/:id/decision", post(review::decide))
        .route("/api/tasks/:id", get(review::get_task))
        .route("/api/tasks/:id/submissions", get(review::task_submissions))
        .route("/api/overdue", get(review::overdue))
        // Administration
        .route("/api/tasks/:id/cancel", post(admin::cancel_task))
        .route("/api/reconcile", post(admin::reconcile))
        .route(
            "/api/cohorts/:cohort/policy",
            get(admin::get_policy).put(admin::save_policy),
        )
        .route(
            "/api/cohorts/:cohort/schedule",
            get(admin::get_schedule).put(admin::save_schedule),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and the background loops.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = create_progress_store(config.store_type, config.data_dir.clone()).await?;
    tracing::info!(
        "Progress store ready ({:?}, persistent: {})",
        config.store_type,
        store.is_persistent()
    );

    let scoring: Arc<dyn ScoringClient> = if config.scoring.is_enabled() {
        Arc::new(HttpScoringClient::new(&config.scoring)?)
    } else {
        tracing::info!("AI scoring disabled (no provider endpoints configured)");
        Arc::new(NoScoring)
    };

    let notifier: Arc<dyn Notifier> = match config.notify_webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(url, Duration::from_secs(10))?),
        None => Arc::new(LogNotifier),
    };

    let state = Arc::new(AppState::new(config.clone(), Arc::clone(&store), scoring));

    let reconcile_loop = Arc::clone(&state.reconciler)
        .spawn(Duration::from_secs(config.reconcile_interval_secs.max(1)));
    let outbox_loop = Arc::new(OutboxDispatcher::new(Arc::clone(&store), notifier))
        .spawn(Duration::from_secs(config.outbox_interval_secs.max(1)));

    let app = router(Arc::clone(&state));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconcile_loop.abort();
    outbox_loop.abort();
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dev_mode: state.config.dev_mode,
        auth_required: state.config.auth.auth_required(state.config.dev_mode),
        persistent_store: state.store.is_persistent(),
    })
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping background loops");
}
