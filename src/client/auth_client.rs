//! auth_client.rs
//!
//! Exchanges the fixed service-account credentials for a short-lived bearer
//! token (password grant) and caches it until shortly before it expires.
//!
//! Assumptions:
//! - The auth service speaks the `/auth/v1/token?grant_type=password` dialect
//!   and wants the anonymous key in an `Apikey` header.
//! - One token is shared by every call the process makes.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ServiceConfig;

/// Per-request timeout for the token exchange.
const AUTH_TIMEOUT_SECS: u64 = 30;
/// Refresh this long before the advertised expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed ({status}): {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("auth response carried no access token")]
    MissingToken,
}

/// A bearer token plus the instant after which it should not be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub access_token: String,
    pub expires_at: Option<Instant>,
}

impl BearerToken {
    pub fn new<S: Into<String>>(access_token: S, expires_in: Option<u64>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: expires_in.map(|secs| Instant::now() + Duration::from_secs(secs)),
        }
    }

    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() + EXPIRY_MARGIN < at,
            None => true,
        }
    }
}

/// Client for the password-grant token endpoint.
pub struct AuthClient {
    http: reqwest::Client,
    auth_url: String,
    anon_key: String,
    email: String,
    password: String,
    cached: Mutex<Option<BearerToken>>,
}

impl AuthClient {
    pub fn new(service: &ServiceConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(AUTH_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            auth_url: service.auth_url.trim_end_matches('/').to_string(),
            anon_key: service.anon_key.clone(),
            email: service.email.clone(),
            password: service.password.clone(),
            cached: Mutex::new(None),
        })
    }

    fn token_url(&self) -> String {
        format!("{}/auth/v1/token?grant_type=password", self.auth_url)
    }

    /// Returns the cached token, or performs the exchange when there is none
    /// (or it is about to expire). Concurrent callers wait on the same exchange.
    pub async fn token(&self) -> Result<BearerToken, AuthError> {
        let mut guard = self.cached.lock().await;
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.clone());
        }
        let token = self.exchange().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Drops the cached token; the next `token()` re-authenticates.
    pub async fn invalidate(&self) {
        debug!("invalidating cached bearer token");
        self.cached.lock().await.take();
    }

    async fn exchange(&self) -> Result<BearerToken, AuthError> {
        let body = PasswordGrant {
            email: &self.email,
            password: &self.password,
        };
        let resp = self
            .http
            .post(self.token_url())
            .header("Apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AuthErrorBody>(&text)
                .ok()
                .and_then(|b| b.error_description.or(b.msg))
                .unwrap_or(text);
            return Err(AuthError::Rejected { status, message });
        }

        let parsed: TokenResponse = resp.json().await?;
        let access_token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        info!(expires_in = ?parsed.expires_in, "obtained bearer token");
        Ok(BearerToken::new(access_token, parsed.expires_in))
    }
}

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AuthErrorBody {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}
