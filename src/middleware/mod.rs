use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use std::sync::Arc;
use uuid::Uuid;

use crate::services::booking::Caller;

/// Caller identity resolved from the `X-Account` header. Upstream
/// authentication has already validated the session; this extractor only maps
/// the username to an account row and its role.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub account_id: Uuid,
    pub username: String,
    pub admin: bool,
}

impl AuthUser {
    pub fn caller(&self) -> Caller {
        Caller { account_id: self.account_id, admin: self.admin }
    }
}

impl FromRequestParts<Arc<crate::AppState>> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<crate::AppState>,
    ) -> Result<Self, Self::Rejection> {
        let username = parts
            .headers
            .get("x-account")
            .and_then(|value| value.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let account = state
            .accounts
            .find_by_username(username)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(AuthUser {
            account_id: account.id,
            admin: account.is_admin(),
            username: account.username,
        })
    }
}
