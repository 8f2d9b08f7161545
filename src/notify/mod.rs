//! Instructor notifications delivered through a persisted outbox.
//!
//! Engine operations append [`Notification`]s to the outbox inside the same
//! store transaction as the state change. The [`OutboxDispatcher`] later
//! hands them to a [`Notifier`] and marks them delivered. Delivery is
//! at-least-once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::ids::{CohortId, LearnerId, SubmissionId, TaskId};
use crate::store::{ProgressStore, StoreError};
use crate::task::{Decision, Submission};

/// What the instructor collaborator is told about a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub submission_id: SubmissionId,
    pub learner_id: LearnerId,
    pub cohort_id: CohortId,
    pub task_id: TaskId,
    pub decision: Decision,
}

impl Notification {
    pub fn for_submission(submission: &Submission, decision: Decision) -> Self {
        Self {
            submission_id: submission.id(),
            learner_id: submission.learner_id(),
            cohort_id: submission.cohort_id(),
            task_id: submission.task_id(),
            decision,
        }
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub notification: Notification,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(String),

    #[error("notification endpoint returned HTTP {0}")]
    Status(u16),
}

/// Instructor notification collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the tracing log. Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            submission_id = %notification.submission_id,
            learner_id = %notification.learner_id,
            cohort_id = %notification.cohort_id,
            decision = ?notification.decision,
            "Instructor notification"
        );
        Ok(())
    }
}

/// Posts each notification as JSON to a webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Moves outbox rows to the notifier.
pub struct OutboxDispatcher {
    store: Arc<dyn ProgressStore>,
    notifier: Arc<dyn Notifier>,
    batch_size: usize,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn ProgressStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            batch_size: 100,
        }
    }

    /// Deliver one batch. Returns how many entries were delivered.
    ///
    /// Stops at the first failed delivery so entries go out in order; the
    /// failed one is retried on the next pass.
    pub async fn dispatch_once(&self) -> Result<usize, StoreError> {
        let pending = self.store.pending_outbox(self.batch_size).await?;
        let mut delivered = Vec::with_capacity(pending.len());

        for entry in &pending {
            match self.notifier.notify(&entry.notification).await {
                Ok(()) => delivered.push(entry.id),
                Err(e) => {
                    tracing::warn!("Failed to deliver notification {}: {}", entry.id, e);
                    break;
                }
            }
        }

        if !delivered.is_empty() {
            self.store.mark_delivered(&delivered).await?;
        }
        Ok(delivered.len())
    }

    /// Run the dispatcher on an interval until the process exits.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Outbox dispatcher started (every {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.dispatch_once().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Delivered {} notifications", n),
                    Err(e) => tracing::warn!("Outbox dispatch failed: {}", e),
                }
            }
        })
    }
}
