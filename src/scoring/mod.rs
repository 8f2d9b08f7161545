//! External AI scoring collaborator.
//!
//! A scoring provider turns an uploaded proof into a 0..=100 score. The
//! engine never depends on an answer: any failure is "no score" and the
//! submission goes to an instructor.

mod error;
mod http;

pub use error::{classify_http_status, ScoringError, ScoringErrorKind};
pub use http::HttpScoringClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::task::{AiProvider, ProofKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreRequest {
    #[serde(skip)]
    pub provider: AiProvider,
    pub proof_kind: ProofKind,
    pub proof_ref: String,
    /// The text the learner was supposed to recite, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoreResponse {
    pub score: u8,
    pub transcript: Option<String>,
}

#[async_trait]
pub trait ScoringClient: Send + Sync {
    async fn score(&self, request: &ScoreRequest) -> Result<ScoreResponse, ScoringError>;
}

/// Scoring client used when no provider is configured.
pub struct NoScoring;

#[async_trait]
impl ScoringClient for NoScoring {
    async fn score(&self, request: &ScoreRequest) -> Result<ScoreResponse, ScoringError> {
        Err(ScoringError::unconfigured(format!(
            "no scoring endpoint for provider {}",
            request.provider.as_str()
        )))
    }
}
