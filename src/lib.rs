//! # Hifz Engine
//!
//! Progress engine for learners memorizing a fixed text page by page.
//!
//! This library provides:
//! - A five-stage curriculum per page and the learner's position in it
//! - Bounded repetition tasks with a single lifecycle authority
//! - Submission verification: manual review or AI-assisted thresholds
//! - Orphan reconciliation after administrative edits or crashed jobs
//! - An HTTP API for the chat front-end, instructors, and administrators
//!
//! ## Submission Flow
//!
//! ```text
//!   proof ──▶ SubmissionVerifier ──▶ TaskLifecycleManager ──▶ ProgressStore
//!                  │ (score?)              │ one ChangeSet        │ outbox
//!                  ▼                       ▼                      ▼
//!             ScoringClient        position advance /     OutboxDispatcher
//!                                  remedial task          ──▶ Notifier
//! ```
//!
//! ## Modules
//! - `curriculum`: stages, line ranges, positions
//! - `task`: tasks, submissions, verification policy
//! - `lifecycle`: the only writer of task state
//! - `verifier`: scoring and decisions
//! - `reconcile`: drift detection and repair
//! - `store`: in-memory and SQLite persistence

pub mod api;
pub mod cohort;
pub mod config;
pub mod curriculum;
pub mod deadline;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod notify;
pub mod reconcile;
pub mod scoring;
pub mod session;
pub mod store;
pub mod task;
pub mod util;
pub mod verifier;

pub use config::Config;
pub use error::{EngineError, EngineResult};
