use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::gmail::{CredentialStore, GmailClient, GmailError, Message, auth::AuthError};
use crate::seen::SeenMessages;

pub const DEFAULT_PAGE_SIZE: u32 = 10;

const UNKNOWN_SENDER: &str = "unknown sender";
const NO_SUBJECT: &str = "no subject";

/// Minimal read-only view of one unread message, built fresh per poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: String,
    pub sender: String,
    pub subject: String,
}

impl MessageSummary {
    fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sender: header_value(message, "From")
                .unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
            subject: header_value(message, "Subject")
                .unwrap_or_else(|| NO_SUBJECT.to_string()),
        }
    }
}

/// First header with the exact (case-sensitive) name, if any.
fn header_value(message: &Message, name: &str) -> Option<String> {
    message.payload.as_ref().and_then(|payload| {
        payload
            .headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.clone())
    })
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),
    #[error("mail API request failed: {0}")]
    Api(#[from] GmailError),
}

impl PollError {
    pub fn is_auth(&self) -> bool {
        matches!(self, PollError::Auth(_))
    }
}

/// One fetch-filter pass over the mailbox. Every call issues fresh API
/// requests; ids are marked seen as they are processed, before any delivery
/// attempt, so a failed notification is never re-sent.
pub struct MailPoller {
    gmail: GmailClient,
    creds: Arc<CredentialStore>,
    seen: SeenMessages,
    page_size: u32,
}

impl MailPoller {
    pub fn new(gmail: GmailClient, creds: Arc<CredentialStore>, page_size: u32) -> Self {
        Self {
            gmail,
            creds,
            seen: SeenMessages::new(),
            page_size,
        }
    }

    /// Yields one summary per genuinely new unread message, in the order the
    /// API returned them. Any API error aborts the remainder of the call.
    pub async fn poll(&mut self) -> Result<Vec<MessageSummary>, PollError> {
        let tokens = self.creds.acquire().await?;

        let listing = match self.gmail.list_unread(&tokens, self.page_size).await {
            Ok(listing) => listing,
            Err(err) => return Err(self.api_error(err).await),
        };

        debug!(unread = listing.messages.len(), "listed unread messages");

        let mut summaries = Vec::new();
        for stub in listing.messages {
            if !self.seen.is_new(&stub.id) {
                continue;
            }

            let message = match self.gmail.get_message(&tokens, &stub.id).await {
                Ok(message) => message,
                Err(err) => return Err(self.api_error(err).await),
            };

            self.seen.mark_seen(stub.id);
            summaries.push(MessageSummary::from_message(&message));
        }

        Ok(summaries)
    }

    /// Authorization failures discard the cached credential so the next
    /// acquire re-authorizes; transient errors leave it untouched.
    async fn api_error(&self, err: GmailError) -> PollError {
        if err.is_unauthorized() {
            self.creds.invalidate().await;
        }
        PollError::Api(err)
    }
}
