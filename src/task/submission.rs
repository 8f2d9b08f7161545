//! Submissions: one proof of completion for one slot of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::task::TaskError;
use crate::ids::{CohortId, LearnerId, SubmissionId, TaskId};

/// Kind of proof the learner uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    Audio,
    Video,
    Text,
}

impl ProofKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofKind::Audio => "audio",
            ProofKind::Video => "video",
            ProofKind::Text => "text",
        }
    }
}

impl FromStr for ProofKind {
    type Err = SubmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(ProofKind::Audio),
            "video" => Ok(ProofKind::Video),
            "text" => Ok(ProofKind::Text),
            other => Err(SubmissionError::UnknownProofKind(other.to_string())),
        }
    }
}

/// Review status of a submission. `Passed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Passed,
    Failed,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Passed => "PASSED",
            SubmissionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SubmissionStatus::Pending),
            "PASSED" => Ok(SubmissionStatus::Passed),
            "FAILED" => Ok(SubmissionStatus::Failed),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

/// A recorded proof for one slot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub(crate) id: SubmissionId,
    pub(crate) task_id: TaskId,
    pub(crate) learner_id: LearnerId,
    pub(crate) cohort_id: CohortId,
    /// 0-based slot within the task's required repetitions
    pub(crate) slot: u32,
    /// Line (learn stages) or repetition index this submission proves
    pub(crate) item: u32,
    pub(crate) proof_kind: ProofKind,
    /// Opaque reference to the uploaded media
    pub(crate) proof_ref: String,
    pub(crate) ai_score: Option<u8>,
    pub(crate) status: SubmissionStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) reviewed_at: Option<DateTime<Utc>>,
    pub(crate) reviewer_id: Option<String>,
    pub(crate) version: u64,
}

impl Submission {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: TaskId,
        learner_id: LearnerId,
        cohort_id: CohortId,
        slot: u32,
        item: u32,
        proof_kind: ProofKind,
        proof_ref: impl Into<String>,
        ai_score: Option<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SubmissionId::new(),
            task_id,
            learner_id,
            cohort_id,
            slot,
            item,
            proof_kind,
            proof_ref: proof_ref.into(),
            ai_score,
            status: SubmissionStatus::Pending,
            created_at: now,
            reviewed_at: None,
            reviewer_id: None,
            version: 0,
        }
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn learner_id(&self) -> LearnerId {
        self.learner_id
    }

    pub fn cohort_id(&self) -> CohortId {
        self.cohort_id
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn item(&self) -> u32 {
        self.item
    }

    pub fn proof_kind(&self) -> ProofKind {
        self.proof_kind
    }

    pub fn proof_ref(&self) -> &str {
        &self.proof_ref
    }

    pub fn ai_score(&self) -> Option<u8> {
        self.ai_score
    }

    pub fn status(&self) -> SubmissionStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn reviewed_at(&self) -> Option<DateTime<Utc>> {
        self.reviewed_at
    }

    pub fn reviewer_id(&self) -> Option<&str> {
        self.reviewer_id.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record the final decision.
    ///
    /// # Precondition
    /// `self.status == Pending`; decisions are never revised.
    pub fn decide(
        &mut self,
        passed: bool,
        reviewer: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SubmissionError> {
        if self.status.is_terminal() {
            return Err(SubmissionError::AlreadyDecided {
                id: self.id,
                status: self.status,
            });
        }
        self.status = if passed {
            SubmissionStatus::Passed
        } else {
            SubmissionStatus::Failed
        };
        self.reviewed_at = Some(now);
        self.reviewer_id = reviewer.map(str::to_string);
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmissionError {
    #[error("Submission {id} was already decided as {status}")]
    AlreadyDecided {
        id: SubmissionId,
        status: SubmissionStatus,
    },

    #[error("Unknown proof kind: {0}")]
    UnknownProofKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> Submission {
        Submission::new(
            TaskId::new(),
            LearnerId::new(),
            CohortId::new(),
            0,
            1,
            ProofKind::Audio,
            "file-1",
            Some(70),
            Utc::now(),
        )
    }

    #[test]
    fn decision_is_terminal() {
        let mut sub = submission();
        assert_eq!(sub.status(), SubmissionStatus::Pending);
        sub.decide(true, Some("instructor-7"), Utc::now()).unwrap();
        assert_eq!(sub.status(), SubmissionStatus::Passed);
        assert_eq!(sub.reviewer_id(), Some("instructor-7"));
        assert!(sub.reviewed_at().is_some());

        let err = sub.decide(false, None, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::AlreadyDecided {
                status: SubmissionStatus::Passed,
                ..
            }
        ));
        assert_eq!(sub.status(), SubmissionStatus::Passed);
    }

    #[test]
    fn automatic_decision_has_no_reviewer() {
        let mut sub = submission();
        sub.decide(false, None, Utc::now()).unwrap();
        assert_eq!(sub.status(), SubmissionStatus::Failed);
        assert!(sub.reviewer_id().is_none());
    }

    #[test]
    fn proof_kind_parses() {
        assert_eq!("video".parse::<ProofKind>().unwrap(), ProofKind::Video);
        assert!("fax".parse::<ProofKind>().is_err());
    }
}
