//! PIN login issuing bearer tokens.
//!
//! - The dashboard submits the gateway PIN to `/api/auth/login`
//! - The server returns a JWT valid for ~30 days
//! - Unless `WINTERM_DEV_MODE=true`, all `/api/*` endpoints require
//!   `Authorization: Bearer <jwt>`
//!
//! The bearer identity is opaque to the rest of the gateway; the attachment
//! token store carries it through the WebSocket handshake for auditing.

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
use rand::RngCore;

use super::routes::AppState;
use super::types::{LoginRequest, LoginResponse};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Claims {
    /// Subject: a random id minted at login.
    sub: String,
    /// Issued-at unix seconds.
    iat: i64,
    /// Expiration unix seconds.
    exp: i64,
}

/// Identity attached to authenticated requests.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
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

fn issue_jwt(secret: &str, ttl_days: i64, subject: String) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = now + Duration::days(ttl_days.max(1));
    let claims = Claims {
        sub: subject,
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
    State(state): State<std::sync::Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    if !constant_time_eq(req.pin.trim(), &state.config.pin) {
        return Err((StatusCode::UNAUTHORIZED, "Invalid PIN".to_string()));
    }

    let mut sub_bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut sub_bytes);

    let (token, exp) = issue_jwt(
        &state.config.jwt_secret,
        state.config.jwt_ttl_days,
        hex::encode(sub_bytes),
    )
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(LoginResponse { token, exp }))
}

pub async fn require_auth(
    State(state): State<std::sync::Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    // Dev mode => no auth checks.
    if state.config.dev_mode {
        req.extensions_mut().insert(AuthUser {
            id: "dev".to_string(),
        });
        return next.run(req).await;
    }

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

    match verify_jwt(token, &state.config.jwt_secret) {
        Ok(claims) => {
            req.extensions_mut().insert(AuthUser { id: claims.sub });
            next.run(req).await
        }
        Err(_) => (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response(),
    }
}
