//! JWT auth for staff and the chat front-end.
//!
//! - Clients submit a role and password to `/api/auth/login`
//! - Server returns a JWT carrying the role, valid for `JWT_TTL_DAYS`
//! - When `DEV_MODE=false`, every other endpoint requires `Authorization: Bearer <jwt>`
//!
//! Roles are ordered: an admin may do anything an instructor may, and an
//! instructor anything the bot may.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::routes::AppState;
use super::types::{LoginRequest, LoginResponse};
use crate::config::AuthConfig;
use crate::util::non_blank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The chat front-end acting for learners
    Bot,
    Instructor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Bot => "bot",
            Role::Instructor => "instructor",
            Role::Admin => "admin",
        }
    }

    fn password<'a>(&self, auth: &'a AuthConfig) -> Option<&'a str> {
        match self {
            Role::Bot => auth.bot_password.as_deref(),
            Role::Instructor => auth.staff_password.as_deref(),
            Role::Admin => auth.admin_password.as_deref(),
        }
    }
}

/// The authenticated caller, inserted as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub subject: String,
    pub role: Role,
}

impl AuthUser {
    fn dev() -> Self {
        Self {
            subject: "dev".to_string(),
            role: Role::Admin,
        }
    }

    /// Reject callers below `role`.
    pub fn require(&self, role: Role) -> Result<(), (StatusCode, String)> {
        if self.role >= role {
            Ok(())
        } else {
            Err((
                StatusCode::FORBIDDEN,
                format!("{} role required", role.as_str()),
            ))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Subject: staff name or role
    sub: String,
    role: Role,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

fn issue_jwt(secret: &str, subject: &str, role: Role, ttl_days: i64) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = now + Duration::days(ttl_days.max(1));
    let claims = Claims {
        sub: subject.to_string(),
        role,
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims.exp))
}

fn verify_jwt(token: &str, secret: &str) -> anyhow::Result<Claims> {
    let validation = Validation::default();
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(token_data.claims)
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    let auth = &state.config.auth;
    let expected = req.role.password(auth).unwrap_or("");

    if expected.is_empty() || !constant_time_eq(req.password.trim(), expected) {
        return Err((StatusCode::UNAUTHORIZED, "Invalid password".to_string()));
    }

    let secret = auth.jwt_secret.as_deref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "JWT_SECRET not configured".to_string(),
        )
    })?;

    let subject = req
        .name
        .as_deref()
        .and_then(non_blank)
        .unwrap_or_else(|| req.role.as_str().to_string());
    let (token, exp) = issue_jwt(secret, &subject, req.role, auth.jwt_ttl_days)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    tracing::info!("Issued {} token for {}", req.role.as_str(), subject);
    Ok(Json(LoginResponse { token, exp }))
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    // Dev mode => no auth checks.
    if !state.config.auth.auth_required(state.config.dev_mode) {
        req.extensions_mut().insert(AuthUser::dev());
        return next.run(req).await;
    }

    // If auth isn't configured, fail closed in non-dev mode.
    let secret = match state.config.auth.jwt_secret.as_deref() {
        Some(s) => s,
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "JWT_SECRET not configured",
            )
                .into_response();
        }
    };

    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let token = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("");

    if token.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
    }

    match verify_jwt(token, secret) {
        Ok(claims) => {
            req.extensions_mut().insert(AuthUser {
                subject: claims.sub,
                role: claims.role,
            });
            next.run(req).await
        }
        Err(_) => (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response(),
    }
}
