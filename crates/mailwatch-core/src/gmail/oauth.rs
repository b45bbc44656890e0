use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(5);

/// OAuth material persisted in the token file. The refresh token is absent
/// when Google does not grant offline access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now + buffer >= self.expires_at
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.needs_refresh(now, DEFAULT_REFRESH_BUFFER)
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("missing refresh token")]
    MissingRefreshToken,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[allow(dead_code)]
    token_type: Option<String>,
}

pub async fn refresh_access_token(
    client: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    tokens: &OAuthTokens,
) -> Result<OAuthTokens, OAuthError> {
    refresh_access_token_with_endpoint(client, client_id, client_secret, tokens, TOKEN_ENDPOINT)
        .await
}

pub async fn refresh_access_token_with_endpoint(
    client: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    tokens: &OAuthTokens,
    endpoint: &str,
) -> Result<OAuthTokens, OAuthError> {
    let refresh_token = match tokens.refresh_token.as_deref() {
        Some(token) if !token.is_empty() => token,
        _ => return Err(OAuthError::MissingRefreshToken),
    };

    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.text().await?;
    let payload: RefreshResponse = serde_json::from_str(&body).map_err(OAuthError::Decode)?;
    if payload.expires_in <= 0 {
        return Err(OAuthError::InvalidExpires(payload.expires_in));
    }

    // Google usually omits refresh_token from refresh responses; keep the one
    // we already hold in that case.
    let refresh_token = payload
        .refresh_token
        .or_else(|| tokens.refresh_token.clone());
    let expires_at = Utc::now() + Duration::seconds(payload.expires_in);

    Ok(OAuthTokens {
        access_token: payload.access_token,
        refresh_token,
        expires_at,
    })
}
