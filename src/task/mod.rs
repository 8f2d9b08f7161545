//! Task module - defines tasks, submissions, and verification policy.
//!
//! This module is designed with formal verification in mind:
//! - All types use algebraic data types with exhaustive matching
//! - Invariants are documented and enforced in transition methods
//! - Pure functions are separated from IO operations

pub mod submission;
#[allow(clippy::module_inception)]
pub mod task;
pub mod verification;

pub use submission::{ProofKind, Submission, SubmissionError, SubmissionStatus};
pub use task::{Task, TaskError, TaskProgress, TaskStatus};
pub use verification::{
    evaluate, AiProvider, Decision, PolicyError, VerificationMode, VerificationPolicy,
};
