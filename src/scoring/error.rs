//! Scoring error types with retry classification.
//!
//! Distinguishes between transient errors (worth one more attempt) and
//! permanent errors. Either way the caller ends up treating the submission
//! as unscored.

use std::time::Duration;

/// Error from the external scoring collaborator.
#[derive(Debug, Clone)]
pub struct ScoringError {
    pub kind: ScoringErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    pub message: String,
}

impl ScoringError {
    pub fn timeout(message: String) -> Self {
        Self {
            kind: ScoringErrorKind::Timeout,
            status_code: None,
            message,
        }
    }

    pub fn network_error(message: String) -> Self {
        Self {
            kind: ScoringErrorKind::NetworkError,
            status_code: None,
            message,
        }
    }

    pub fn http_error(status_code: u16, message: String) -> Self {
        Self {
            kind: classify_http_status(status_code),
            status_code: Some(status_code),
            message,
        }
    }

    pub fn parse_error(message: String) -> Self {
        Self {
            kind: ScoringErrorKind::ParseError,
            status_code: None,
            message,
        }
    }

    /// The provider answered but reported it could not score the proof.
    pub fn rejected(message: String) -> Self {
        Self {
            kind: ScoringErrorKind::Rejected,
            status_code: None,
            message,
        }
    }

    pub fn unconfigured(message: String) -> Self {
        Self {
            kind: ScoringErrorKind::Unconfigured,
            status_code: None,
            message,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Exponential backoff starting at 250ms, capped at 2s.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        let base_ms: u64 = match self.kind {
            ScoringErrorKind::RateLimited => 1000,
            _ => 250,
        };
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms.min(2000))
    }
}

impl std::fmt::Display for ScoringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ScoringError {}

/// Classification of scoring errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringErrorKind {
    /// Request exceeded the configured timeout - transient
    Timeout,
    /// Connection failed - transient
    NetworkError,
    /// 429 - transient
    RateLimited,
    /// 5xx - transient
    ServerError,
    /// 4xx - permanent
    ClientError,
    /// Response body was not the expected shape, or score out of range
    ParseError,
    /// Provider returned `error_details`
    Rejected,
    /// No endpoint configured for the provider
    Unconfigured,
}

impl ScoringErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScoringErrorKind::Timeout
                | ScoringErrorKind::NetworkError
                | ScoringErrorKind::RateLimited
                | ScoringErrorKind::ServerError
        )
    }
}

impl std::fmt::Display for ScoringErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoringErrorKind::Timeout => write!(f, "Timeout"),
            ScoringErrorKind::NetworkError => write!(f, "Network error"),
            ScoringErrorKind::RateLimited => write!(f, "Rate limited"),
            ScoringErrorKind::ServerError => write!(f, "Server error"),
            ScoringErrorKind::ClientError => write!(f, "Client error"),
            ScoringErrorKind::ParseError => write!(f, "Parse error"),
            ScoringErrorKind::Rejected => write!(f, "Rejected by provider"),
            ScoringErrorKind::Unconfigured => write!(f, "Unconfigured"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> ScoringErrorKind {
    match status {
        429 => ScoringErrorKind::RateLimited,
        400..=499 => ScoringErrorKind::ClientError,
        _ => ScoringErrorKind::ServerError,
    }
}
