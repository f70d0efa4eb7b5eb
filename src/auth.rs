//! Identity collaborator seam.
//!
//! Authentication itself lives in an external identity service; this
//! module only resolves a bearer token into a [`Principal`] and checks
//! expiry. The identity service's answer is trusted verbatim.

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GateError, Result};

/// Authenticated caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub email: String,
    /// Session expiry as a unix timestamp, when the identity service
    /// reports one.
    pub expires_at: Option<i64>,
}

impl Principal {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= chrono::Utc::now().timestamp(),
            None => false,
        }
    }
}

/// Resolves bearer tokens to principals.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a token. Fails with [`GateError::Auth`] for unknown or
    /// expired tokens.
    async fn get_user(&self, token: &str) -> Result<Principal>;
}

#[async_trait]
impl<T: IdentityProvider + ?Sized> IdentityProvider for Arc<T> {
    async fn get_user(&self, token: &str) -> Result<Principal> {
        (**self).get_user(token).await
    }
}

/// Identity provider backed by the identity service's HTTP user endpoint.
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct IdentityUser {
    id: String,
    email: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl HttpIdentityProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GateError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn get_user(&self, token: &str) -> Result<Principal> {
        let url = format!("{}/auth/v1/user", self.base_url.trim_end_matches('/'));

        let response = self.client.get(&url).bearer_auth(token).send().await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GateError::auth("invalid or expired token"));
        }
        if !response.status().is_success() {
            return Err(GateError::unavailable(format!(
                "identity service returned {}",
                response.status()
            )));
        }

        let user: IdentityUser = response.json().await?;

        Ok(Principal {
            id: user.id,
            email: user.email,
            expires_at: user.expires_at,
        })
    }
}

/// Extract the bearer token from an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<String> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| GateError::auth("missing Authorization header"))?
        .to_str()
        .map_err(|_| GateError::auth("malformed Authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(|| GateError::auth("expected Bearer authorization"))?;

    if token.is_empty() {
        return Err(GateError::auth("empty bearer token"));
    }

    Ok(token.to_string())
}
