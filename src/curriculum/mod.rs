//! Curriculum model - stages, line ranges, and learner positions.
//!
//! A page has [`LINES_PER_PAGE`] lines split into two halves. Each page is
//! mastered through five stages:
//!
//! ```text
//! S1_LEARN -> S1_REVIEW -> S2_LEARN -> S2_REVIEW -> CONSOLIDATE
//!     ^                                                  |
//!     +------------------- page + 1 ---------------------+
//! ```
//!
//! # Invariants
//! - `page >= 1`
//! - `line` lies inside the half covered by `stage`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{CohortId, LearnerId};

/// Number of lines on every page of the text.
pub const LINES_PER_PAGE: u32 = 15;

/// Last line of the first half; the second half starts right after it.
pub const FIRST_HALF_END: u32 = 7;

/// Stage of mastery for the current page.
///
/// The declaration order is the total order of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Line-by-line acquisition of the first half
    S1Learn,
    /// Group repetition of the first half
    S1Review,
    /// Line-by-line acquisition of the second half
    S2Learn,
    /// Group repetition of the second half
    S2Review,
    /// Whole-page consolidation
    Consolidate,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::S1Learn,
        Stage::S1Review,
        Stage::S2Learn,
        Stage::S2Review,
        Stage::Consolidate,
    ];

    /// The stage that follows this one on the same page.
    ///
    /// Returns `None` for `Consolidate`; the caller wraps to the next page.
    pub fn next_on_page(self) -> Option<Stage> {
        match self {
            Stage::S1Learn => Some(Stage::S1Review),
            Stage::S1Review => Some(Stage::S2Learn),
            Stage::S2Learn => Some(Stage::S2Review),
            Stage::S2Review => Some(Stage::Consolidate),
            Stage::Consolidate => None,
        }
    }

    /// Whether the stage is a line-by-line acquisition stage.
    pub fn is_learn(self) -> bool {
        matches!(self, Stage::S1Learn | Stage::S2Learn)
    }

    pub fn group(self) -> StageGroup {
        match self {
            Stage::S1Learn | Stage::S2Learn => StageGroup::Learn,
            Stage::S1Review | Stage::S2Review => StageGroup::Review,
            Stage::Consolidate => StageGroup::Consolidate,
        }
    }

    /// Lines of the page this stage works on.
    pub fn span(self) -> LineRange {
        match self {
            Stage::S1Learn | Stage::S1Review => LineRange {
                start: 1,
                end: FIRST_HALF_END,
            },
            Stage::S2Learn | Stage::S2Review => LineRange {
                start: FIRST_HALF_END + 1,
                end: LINES_PER_PAGE,
            },
            Stage::Consolidate => LineRange {
                start: 1,
                end: LINES_PER_PAGE,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::S1Learn => "S1_LEARN",
            Stage::S1Review => "S1_REVIEW",
            Stage::S2Learn => "S2_LEARN",
            Stage::S2Review => "S2_REVIEW",
            Stage::Consolidate => "CONSOLIDATE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CurriculumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S1_LEARN" => Ok(Stage::S1Learn),
            "S1_REVIEW" => Ok(Stage::S1Review),
            "S2_LEARN" => Ok(Stage::S2Learn),
            "S2_REVIEW" => Ok(Stage::S2Review),
            "CONSOLIDATE" => Ok(Stage::Consolidate),
            other => Err(CurriculumError::UnknownStage(other.to_string())),
        }
    }
}

/// Deadline grouping of stages; indexes `CohortScheduleConfig::stage_durations_hours`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageGroup {
    Learn,
    Review,
    Consolidate,
}

impl StageGroup {
    pub fn index(self) -> usize {
        match self {
            StageGroup::Learn => 0,
            StageGroup::Review => 1,
            StageGroup::Consolidate => 2,
        }
    }
}

/// Inclusive range of lines on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Result<Self, CurriculumError> {
        if start < 1 || end > LINES_PER_PAGE || start > end {
            return Err(CurriculumError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Number of lines covered (never zero for a validated range).
    pub fn line_count(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, line: u32) -> bool {
        line >= self.start && line <= self.end
    }
}

/// The (stage, page, line) triple shared by positions and tasks.
///
/// Drift detection compares two of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionPoint {
    pub stage: Stage,
    pub page: u32,
    pub line: u32,
}

/// A learner's live place in the curriculum for one cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurriculumPosition {
    pub learner_id: LearnerId,
    pub cohort_id: CohortId,
    pub page: u32,
    pub line: u32,
    pub stage: Stage,
    /// Whether the enrollment is active
    pub active: bool,
    /// Optimistic concurrency version, bumped by the store on every write
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl CurriculumPosition {
    /// Create a validated position.
    ///
    /// # Errors
    /// Fails when `page == 0` or `line` is outside the stage's span.
    pub fn new(
        learner_id: LearnerId,
        cohort_id: CohortId,
        page: u32,
        line: u32,
        stage: Stage,
    ) -> Result<Self, CurriculumError> {
        validate_point(page, line, stage)?;
        Ok(Self {
            learner_id,
            cohort_id,
            page,
            line,
            stage,
            active: true,
            version: 0,
            updated_at: Utc::now(),
        })
    }

    /// Starting position for a fresh enrollment.
    pub fn start_of_page(
        learner_id: LearnerId,
        cohort_id: CohortId,
        page: u32,
    ) -> Result<Self, CurriculumError> {
        Self::new(learner_id, cohort_id, page, 1, Stage::S1Learn)
    }

    pub fn point(&self) -> PositionPoint {
        PositionPoint {
            stage: self.stage,
            page: self.page,
            line: self.line,
        }
    }

    /// The position reached after completing the current stage.
    ///
    /// `Consolidate` wraps to `S1Learn` on the next page, line 1.
    pub fn advanced(&self) -> CurriculumPosition {
        let mut next = self.clone();
        match self.stage.next_on_page() {
            Some(stage) => {
                next.stage = stage;
                next.line = stage.span().start;
            }
            None => {
                next.stage = Stage::S1Learn;
                next.page = self.page + 1;
                next.line = 1;
            }
        }
        next
    }
}

/// Validate a (page, line, stage) triple.
pub fn validate_point(page: u32, line: u32, stage: Stage) -> Result<(), CurriculumError> {
    if page < 1 {
        return Err(CurriculumError::InvalidPage(page));
    }
    if !stage.span().contains(line) {
        return Err(CurriculumError::LineOutsideStage { line, stage });
    }
    Ok(())
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CurriculumError {
    #[error("Page must be at least 1, got {0}")]
    InvalidPage(u32),

    #[error("Line {line} is outside the span of stage {stage}")]
    LineOutsideStage { line: u32, stage: Stage },

    #[error("Invalid line range [{start}, {end}]")]
    InvalidRange { start: u32, end: u32 },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),
}
