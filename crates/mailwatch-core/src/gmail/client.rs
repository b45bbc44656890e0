use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::gmail::oauth::OAuthTokens;
use crate::gmail::types::{ListMessagesResponse, Message};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";

/// Gmail treats this search the same way the inbox "unread" filter does.
pub const UNREAD_QUERY: &str = "is:unread";

#[derive(Debug, Error)]
pub enum GmailError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unauthorized")]
    Unauthorized,
}

impl GmailError {
    /// Authorization failures invalidate the cached credential; everything
    /// else is retried naturally on the next poll tick.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            GmailError::Unauthorized => true,
            GmailError::Http(err) => err.status() == Some(StatusCode::UNAUTHORIZED),
            GmailError::Decode(_) => false,
        }
    }
}

/// Thin client over the Gmail REST API. Credential lifecycle lives in
/// `CredentialStore`; callers pass the bearer token per request.
pub struct GmailClient {
    http: Client,
    user_id: String,
    api_base: String,
}

impl GmailClient {
    pub fn new(http: Client, user_id: impl Into<String>) -> Self {
        Self {
            http,
            user_id: user_id.into(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Lists up to `max_results` unread message stubs.
    pub async fn list_unread(
        &self,
        tokens: &OAuthTokens,
        max_results: u32,
    ) -> Result<ListMessagesResponse, GmailError> {
        let url = format!("{}/{}/messages", self.api_base, self.user_id);
        self.send_json(tokens, || {
            self.http
                .get(&url)
                .query(&[("q", UNREAD_QUERY)])
                .query(&[("maxResults", max_results)])
        })
        .await
    }

    /// Fetches one message with its full header set.
    pub async fn get_message(
        &self,
        tokens: &OAuthTokens,
        message_id: &str,
    ) -> Result<Message, GmailError> {
        let url = format!("{}/{}/messages/{}", self.api_base, self.user_id, message_id);
        self.send_json(tokens, || self.http.get(&url).query(&[("format", "full")]))
            .await
    }

    async fn send_json<T, B>(&self, tokens: &OAuthTokens, build: B) -> Result<T, GmailError>
    where
        T: DeserializeOwned,
        B: Fn() -> reqwest::RequestBuilder,
    {
        let response = build().bearer_auth(&tokens.access_token).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(GmailError::Unauthorized);
        }

        let response = response.error_for_status()?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(GmailError::Decode)
    }
}
