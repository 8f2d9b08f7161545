//! Pure drift detection between a task and the learner's live position.

use serde::Serialize;

use crate::curriculum::{CurriculumPosition, PositionPoint, Stage};

/// Why a task no longer matches the live position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Drift {
    None,
    /// The learner has no enrollment for the cohort
    MissingEnrollment,
    /// The enrollment exists but is deactivated
    InactiveEnrollment,
    StageMismatch { expected: Stage, live: Stage },
    PageMismatch { expected: u32, live: u32 },
    /// Learn stages only: the task starts on a different line than the learner is on
    LineMismatch { expected: u32, live: u32 },
}

impl Drift {
    pub fn is_drifted(&self) -> bool {
        !matches!(self, Drift::None)
    }

    /// Whether a replacement task can be planned from the live position.
    pub fn has_live_position(&self) -> bool {
        !matches!(self, Drift::MissingEnrollment | Drift::InactiveEnrollment)
    }
}

/// Compare the point a task was scoped for with the live position.
///
/// Checks run in order: enrollment, stage, page, then line for learn stages.
/// Review and consolidation tasks span a whole range, so their line is not compared.
pub fn detect_drift(expected: &PositionPoint, live: Option<&CurriculumPosition>) -> Drift {
    let Some(live) = live else {
        return Drift::MissingEnrollment;
    };
    if !live.active {
        return Drift::InactiveEnrollment;
    }
    if expected.stage != live.stage {
        return Drift::StageMismatch {
            expected: expected.stage,
            live: live.stage,
        };
    }
    if expected.page != live.page {
        return Drift::PageMismatch {
            expected: expected.page,
            live: live.page,
        };
    }
    if expected.stage.is_learn() && expected.line != live.line {
        return Drift::LineMismatch {
            expected: expected.line,
            live: live.line,
        };
    }
    Drift::None
}
