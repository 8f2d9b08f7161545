//! Verification policy and the pass/fail decision for a submission.
//!
//! # Design Principles
//! - The decision is a pure function of the AI score and the cohort policy
//! - Missing scores never auto-fail; they go to a human
//! - Misconfigured policies are rejected when saved, not when evaluated

use serde::{Deserialize, Serialize};

/// External scoring provider a cohort uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiProvider {
    None,
    A,
    B,
}

impl AiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiProvider::None => "NONE",
            AiProvider::A => "A",
            AiProvider::B => "B",
        }
    }
}

/// How much of the decision is automated.
///
/// # Exhaustive Matching
/// All variants must be handled explicitly - no catch-all allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationMode {
    /// Every submission goes to an instructor
    Manual,
    /// High scores pass automatically; everything else goes to an instructor
    SemiAuto,
    /// High scores pass, low scores fail, the band in between goes to an instructor
    FullAuto,
}

/// Outcome of evaluating one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Pass,
    Fail,
    PendingHuman,
}

impl Decision {
    /// `Some(passed)` for automatic decisions.
    pub fn as_passed(&self) -> Option<bool> {
        match self {
            Decision::Pass => Some(true),
            Decision::Fail => Some(false),
            Decision::PendingHuman => None,
        }
    }
}

/// Per-cohort verification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPolicy {
    pub ai_provider: AiProvider,
    pub mode: VerificationMode,
    /// Scores at or above this pass automatically (0..=100)
    pub accept_threshold: u8,
    /// Scores below this fail automatically; FULL_AUTO only
    pub reject_threshold: Option<u8>,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            ai_provider: AiProvider::None,
            mode: VerificationMode::Manual,
            accept_threshold: 85,
            reject_threshold: None,
        }
    }
}

impl VerificationPolicy {
    /// Check the policy before it is saved.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.accept_threshold > 100 {
            return Err(PolicyError::ThresholdOutOfRange(self.accept_threshold));
        }
        if let Some(reject) = self.reject_threshold {
            if reject > 100 {
                return Err(PolicyError::ThresholdOutOfRange(reject));
            }
        }
        if self.mode == VerificationMode::FullAuto {
            let reject = self
                .reject_threshold
                .ok_or(PolicyError::MissingRejectThreshold)?;
            if reject >= self.accept_threshold {
                return Err(PolicyError::RejectNotBelowAccept {
                    reject,
                    accept: self.accept_threshold,
                });
            }
        }
        Ok(())
    }

    /// Whether evaluating under this policy can use an AI score at all.
    pub fn needs_score(&self) -> bool {
        self.ai_provider != AiProvider::None && self.mode != VerificationMode::Manual
    }
}

/// Decide a submission from its AI score.
///
/// # Properties
/// - MANUAL or provider NONE: always `PendingHuman`
/// - SEMI_AUTO never returns `Fail`
/// - no score: always `PendingHuman`
pub fn evaluate(ai_score: Option<u8>, policy: &VerificationPolicy) -> Decision {
    if !policy.needs_score() {
        return Decision::PendingHuman;
    }
    let Some(score) = ai_score else {
        return Decision::PendingHuman;
    };

    match policy.mode {
        VerificationMode::Manual => Decision::PendingHuman,
        VerificationMode::SemiAuto => {
            if score >= policy.accept_threshold {
                Decision::Pass
            } else {
                Decision::PendingHuman
            }
        }
        VerificationMode::FullAuto => {
            if score >= policy.accept_threshold {
                Decision::Pass
            } else if policy.reject_threshold.is_some_and(|reject| score < reject) {
                Decision::Fail
            } else {
                Decision::PendingHuman
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("reject threshold {reject} must be below accept threshold {accept}")]
    RejectNotBelowAccept { reject: u8, accept: u8 },

    #[error("FULL_AUTO mode requires a reject threshold")]
    MissingRejectThreshold,

    #[error("threshold {0} is outside 0..=100")]
    ThresholdOutOfRange(u8),
}
