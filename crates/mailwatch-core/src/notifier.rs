use std::sync::Arc;

use tracing::warn;

use crate::poller::MessageSummary;
use crate::telegram::{ChatId, TelegramClient, TelegramError};

/// Delivers notifications to the single bound chat. The destination is nil
/// until the first `/start`; re-binding overwrites it, most recent wins.
pub struct NotificationDispatcher {
    telegram: Arc<TelegramClient>,
    destination: Option<ChatId>,
}

impl NotificationDispatcher {
    pub fn new(telegram: Arc<TelegramClient>) -> Self {
        Self {
            telegram,
            destination: None,
        }
    }

    pub fn bind(&mut self, chat_id: ChatId) {
        self.destination = Some(chat_id);
    }

    pub fn destination(&self) -> Option<ChatId> {
        self.destination
    }

    /// Formats and delivers one notification. A send before any bind is a
    /// logged no-op, not an error.
    pub async fn send(&self, summary: &MessageSummary) -> Result<(), TelegramError> {
        self.send_text(&format_notification(summary)).await
    }

    /// Raw text to the bound chat; used for user-visible failure reports.
    pub async fn send_text(&self, text: &str) -> Result<(), TelegramError> {
        let Some(chat_id) = self.destination else {
            warn!("no destination bound yet, skipping notification");
            return Ok(());
        };
        self.telegram.send_message(chat_id, text).await
    }
}

fn format_notification(summary: &MessageSummary) -> String {
    format!(
        "📧 New mail!\nFrom: {}\nSubject: {}",
        summary.sender, summary.subject
    )
}
