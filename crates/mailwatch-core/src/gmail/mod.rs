pub mod auth;
pub mod client;
pub mod oauth;
pub mod types;

pub use auth::{AuthError, CredentialStore};
pub use client::{GmailClient, GmailError, UNREAD_QUERY};
pub use oauth::{DEFAULT_REFRESH_BUFFER, OAuthError, OAuthTokens, refresh_access_token};
pub use types::*;
