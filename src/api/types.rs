//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::curriculum::{CurriculumPosition, Stage};
use crate::ids::CohortId;
use crate::reconcile::ReconcileReport;
use crate::session::SessionKind;
use crate::task::ProofKind;

use super::auth::Role;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub dev_mode: bool,
    pub auth_required: bool,
    /// Whether the progress store survives restarts
    pub persistent_store: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub role: Role,
    pub password: String,
    /// Staff member name, recorded as reviewer on decisions
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    /// Expiration unix seconds
    pub exp: i64,
}

/// Proof upload from the chat front-end.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitProofRequest {
    pub proof_kind: ProofKind,
    /// Reference to the stored media or text
    pub proof_ref: String,
    pub reference_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionRequest {
    pub passed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelTaskRequest {
    pub reason: Option<String>,
}

/// Administrative position override.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionOverrideRequest {
    pub page: u32,
    pub line: u32,
    pub stage: Stage,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollRequest {
    /// Starting page; defaults to 1
    pub page: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionOverrideResponse {
    pub position: CurriculumPosition,
    pub reconcile: ReconcileReport,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewQuery {
    pub cohort_id: Option<CohortId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionRequest {
    pub kind: SessionKind,
    #[serde(default)]
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSessionRequest {
    pub state: serde_json::Value,
}
