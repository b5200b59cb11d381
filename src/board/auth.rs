//! Sessions and the `CurrentUser` extractor.
//!
//! Identity comes from an opaque bearer token. Browsers cannot set headers on
//! WebSocket upgrades, so a `token` query parameter is accepted as well.

use axum::extract::{FromRequestParts, Query};
use axum::http::{header, request::Parts};
use serde::Deserialize;
use tracing::info;

use super::api::{ApiError, SharedState};
use super::db::BoardDb;
use super::models::{LoginRequest, LoginResponse, User};
use crate::errors::{BoardError, BoardResult};

/// Sign in by name and email, creating the user on first login.
pub fn login(db: &BoardDb, input: LoginRequest) -> BoardResult<LoginResponse> {
    let name = input.name.trim();
    let email = input.email.trim().to_lowercase();
    if name.is_empty() {
        return Err(BoardError::validation("Name is required"));
    }
    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(BoardError::validation("A valid email is required"));
    }

    let user = db.upsert_user(name, &email)?;
    let session = db.create_session(&user.id)?;
    info!(user_id = %user.id, "User logged in");
    Ok(LoginResponse {
        token: session.token,
        user,
    })
}

/// Resolve a session token to its user.
pub fn authenticate(db: &BoardDb, token: &str) -> BoardResult<User> {
    db.user_for_token(token)?.ok_or(BoardError::Unauthorized)
}

pub fn logout(db: &BoardDb, token: &str) -> BoardResult<()> {
    db.delete_session(token)?;
    Ok(())
}

#[derive(Deserialize)]
struct TokenParam {
    token: Option<String>,
}

/// Token from `Authorization: Bearer …`, falling back to `?token=…`.
pub fn request_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    from_header
        .or_else(|| {
            Query::<TokenParam>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(p)| p.token)
        })
        .filter(|t| !t.is_empty())
}

/// The authenticated caller of a request.
pub struct CurrentUser {
    pub user: User,
    pub token: String,
}

impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = request_token(parts).ok_or(ApiError::Unauthorized)?;
        let lookup = token.clone();
        let user = state
            .db
            .run(move |db| authenticate(db, &lookup))
            .await?;
        Ok(Self { user, token })
    }
}
