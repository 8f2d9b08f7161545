//! Submission verification.
//!
//! Scores a proof when the cohort's policy asks for it, turns the score into
//! a decision, and hands the decision to the lifecycle manager. Scoring is
//! best-effort: when the provider is down, slow, or unsure, the submission
//! waits for an instructor instead.

use serde::Serialize;
use std::sync::Arc;

use crate::cohort::CohortScheduleConfig;
use crate::error::{EngineError, EngineResult};
use crate::ids::{CohortId, LearnerId, SubmissionId};
use crate::lifecycle::{OutcomeReport, RecordedSubmission, SubmissionDraft, TaskLifecycleManager};
use crate::scoring::{ScoreRequest, ScoringClient};
use crate::store::ProgressStore;
use crate::task::{evaluate, Decision, ProofKind, Submission, VerificationPolicy};

pub const AWAITING_REVIEW_MESSAGE: &str = "Recorded, awaiting review";
const PASSED_MESSAGE: &str = "Accepted";
const FAILED_MESSAGE: &str = "Not accepted, please try again";

/// A proof uploaded by a learner.
#[derive(Debug, Clone)]
pub struct ProofUpload {
    pub proof_kind: ProofKind,
    pub proof_ref: String,
    /// Expected recitation, forwarded to the scorer
    pub reference_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    #[serde(flatten)]
    pub recorded: RecordedSubmission,
    /// What the learner is told. Identical for every pending outcome.
    pub learner_message: &'static str,
}

fn learner_message(decision: Decision) -> &'static str {
    match decision {
        Decision::Pass => PASSED_MESSAGE,
        Decision::Fail => FAILED_MESSAGE,
        Decision::PendingHuman => AWAITING_REVIEW_MESSAGE,
    }
}

pub struct SubmissionVerifier {
    store: Arc<dyn ProgressStore>,
    lifecycle: Arc<TaskLifecycleManager>,
    scoring: Arc<dyn ScoringClient>,
}

impl SubmissionVerifier {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        lifecycle: Arc<TaskLifecycleManager>,
        scoring: Arc<dyn ScoringClient>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            scoring,
        }
    }

    /// The cohort's policy, or the all-manual default.
    pub async fn policy_for(&self, cohort_id: CohortId) -> EngineResult<VerificationPolicy> {
        Ok(self.store.get_policy(cohort_id).await?.unwrap_or_default())
    }

    /// Score a proof if the policy needs it. Failures become "no score".
    async fn score(&self, upload: &ProofUpload, policy: &VerificationPolicy) -> Option<u8> {
        if !policy.needs_score() {
            return None;
        }
        let request = ScoreRequest {
            provider: policy.ai_provider,
            proof_kind: upload.proof_kind,
            proof_ref: upload.proof_ref.clone(),
            reference_text: upload.reference_text.clone(),
        };
        match self.scoring.score(&request).await {
            Ok(response) => Some(response.score),
            Err(e) => {
                let error = EngineError::ExternalScoringUnavailable(e);
                tracing::warn!("{}; {} goes to human review", error, upload.proof_ref);
                None
            }
        }
    }

    /// Record a learner's proof against their active task.
    pub async fn submit(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
        upload: ProofUpload,
    ) -> EngineResult<SubmitOutcome> {
        let policy = self.policy_for(cohort_id).await?;
        // Fail before scoring when the learner cannot submit at all.
        let task = self.lifecycle.ensure_active_task(learner_id, cohort_id).await?;

        let ai_score = self.score(&upload, &policy).await;
        let decision = evaluate(ai_score, &policy);
        tracing::debug!(
            "Submission from learner {}: score {:?}, mode {:?} -> {:?}",
            learner_id,
            ai_score,
            policy.mode,
            decision
        );

        let draft = SubmissionDraft {
            proof_kind: upload.proof_kind,
            proof_ref: upload.proof_ref,
            ai_score,
            for_task: Some(task.id()),
        };
        let recorded = self
            .lifecycle
            .record_submission(learner_id, cohort_id, draft, decision)
            .await?;
        Ok(SubmitOutcome {
            recorded,
            learner_message: learner_message(decision),
        })
    }

    /// Apply an instructor's verdict. Decisions are final.
    pub async fn record_human_decision(
        &self,
        submission_id: SubmissionId,
        passed: bool,
        reviewer_id: &str,
    ) -> EngineResult<OutcomeReport> {
        let report = self
            .lifecycle
            .settle_submission(submission_id, passed, Some(reviewer_id))
            .await?;
        tracing::info!(
            "Reviewer {} {} submission {}",
            reviewer_id,
            if passed { "passed" } else { "failed" },
            submission_id
        );
        Ok(report)
    }

    /// The instructor review queue.
    pub async fn pending_reviews(&self, cohort_id: Option<CohortId>) -> EngineResult<Vec<Submission>> {
        Ok(self.store.list_pending_submissions(cohort_id).await?)
    }

    pub async fn save_policy(
        &self,
        cohort_id: CohortId,
        policy: VerificationPolicy,
    ) -> EngineResult<VerificationPolicy> {
        policy.validate()?;
        self.store.put_policy(cohort_id, &policy).await?;
        tracing::info!("Saved verification policy for cohort {}: {:?}", cohort_id, policy);
        Ok(policy)
    }

    pub async fn save_schedule(
        &self,
        cohort_id: CohortId,
        schedule: CohortScheduleConfig,
    ) -> EngineResult<CohortScheduleConfig> {
        schedule.validate()?;
        self.store.put_schedule(cohort_id, &schedule).await?;
        tracing::info!("Saved schedule for cohort {}: {:?}", cohort_id, schedule);
        Ok(schedule)
    }
}
