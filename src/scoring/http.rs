//! HTTP scoring client with a short retry for transient errors.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{ScoreRequest, ScoreResponse, ScoringClient, ScoringError};
use crate::config::ScoringConfig;
use crate::task::AiProvider;

/// Wire shape of a provider answer.
#[derive(Debug, Deserialize)]
struct RawScore {
    score: Option<f64>,
    transcript: Option<String>,
    error_details: Option<serde_json::Value>,
}

/// Turn a provider answer into a score, rejecting anything suspicious.
fn interpret(raw: RawScore) -> Result<ScoreResponse, ScoringError> {
    if let Some(details) = raw.error_details {
        if !details.is_null() {
            return Err(ScoringError::rejected(details.to_string()));
        }
    }
    let score = raw
        .score
        .ok_or_else(|| ScoringError::parse_error("response has no score".to_string()))?;
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(ScoringError::parse_error(format!(
            "score {} is outside 0..=100",
            score
        )));
    }
    Ok(ScoreResponse {
        score: score.round() as u8,
        transcript: raw.transcript,
    })
}

pub struct HttpScoringClient {
    client: reqwest::Client,
    provider_a_url: Option<String>,
    provider_b_url: Option<String>,
    api_key: Option<String>,
    max_retries: u32,
}

impl HttpScoringClient {
    pub fn new(config: &ScoringConfig) -> Result<Self, ScoringError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ScoringError::network_error(e.to_string()))?;
        Ok(Self {
            client,
            provider_a_url: config.provider_a_url.clone(),
            provider_b_url: config.provider_b_url.clone(),
            api_key: config.api_key.clone(),
            max_retries: 1,
        })
    }

    /// Use a custom request timeout (tests use a short one).
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ScoringError> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScoringError::network_error(e.to_string()))?;
        Ok(self)
    }

    fn endpoint(&self, provider: AiProvider) -> Option<&str> {
        match provider {
            AiProvider::None => None,
            AiProvider::A => self.provider_a_url.as_deref(),
            AiProvider::B => self.provider_b_url.as_deref(),
        }
    }

    /// Execute a single request without retry.
    async fn execute_request(
        &self,
        url: &str,
        request: &ScoreRequest,
    ) -> Result<ScoreResponse, ScoringError> {
        let mut builder = self.client.post(url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ScoringError::timeout(e.to_string())
            } else if e.is_connect() {
                ScoringError::network_error(format!("connection failed: {}", e))
            } else {
                ScoringError::network_error(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScoringError::http_error(status.as_u16(), body));
        }

        let raw: RawScore = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ScoringError::timeout(e.to_string())
            } else {
                ScoringError::parse_error(e.to_string())
            }
        })?;
        interpret(raw)
    }
}

#[async_trait]
impl ScoringClient for HttpScoringClient {
    async fn score(&self, request: &ScoreRequest) -> Result<ScoreResponse, ScoringError> {
        let url = self.endpoint(request.provider).ok_or_else(|| {
            ScoringError::unconfigured(format!(
                "no scoring endpoint for provider {}",
                request.provider.as_str()
            ))
        })?;

        let mut attempt = 0;
        loop {
            match self.execute_request(url, request).await {
                Ok(response) => {
                    tracing::debug!(
                        "Scored {} via provider {}: {}",
                        request.proof_ref,
                        request.provider.as_str(),
                        response.score
                    );
                    return Ok(response);
                }
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    let delay = error.suggested_delay(attempt);
                    tracing::warn!(
                        "Scoring attempt {} failed with {}, retrying in {:?}",
                        attempt + 1,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
