use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gmail::CredentialStore;
use crate::scheduler::{Scheduler, SharedPipeline};
use crate::telegram::{ChatId, IncomingMessage, TelegramClient};

const LONG_POLL_TIMEOUT_SECS: u64 = 30;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

const GREETING: &str =
    "Hi! I'm a bot that notifies you about new mail.\nConnecting to Gmail now...";
const AUTH_SUCCESS: &str = "✅ Connected to Gmail!";
const CHECKING: &str = "Checking mail...";

/// Command front end. Long-polls the bot API for updates and drives the
/// polling pipeline from `/start` and `/check`.
pub struct Bot {
    telegram: Arc<TelegramClient>,
    pipeline: SharedPipeline,
    scheduler: Arc<Scheduler>,
    creds: Arc<CredentialStore>,
}

impl Bot {
    pub fn new(
        telegram: Arc<TelegramClient>,
        pipeline: SharedPipeline,
        scheduler: Arc<Scheduler>,
        creds: Arc<CredentialStore>,
    ) -> Self {
        Self {
            telegram,
            pipeline,
            scheduler,
            creds,
        }
    }

    /// Update loop. Failed fetches back off exponentially so a bot API
    /// outage does not spin the loop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut offset: Option<i64> = None;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let updates = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("bot update loop shutting down");
                    return;
                }
                result = self.telegram.get_updates(offset, LONG_POLL_TIMEOUT_SECS) => result,
            };

            match updates {
                Ok(updates) => {
                    backoff = INITIAL_BACKOFF;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        if let Some(message) = update.message.as_ref() {
                            self.handle_message(message).await;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, backoff_secs = backoff.as_secs(), "failed to fetch updates");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn handle_message(&self, message: &IncomingMessage) {
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let chat_id = message.chat.id;

        match command_name(text) {
            Some("/start") => self.handle_start(chat_id).await,
            Some("/check") => self.handle_check(chat_id).await,
            _ => debug!(chat_id, "ignoring message without a known command"),
        }
    }

    /// Binds the invoking chat as the notification destination, acquires a
    /// mail credential, and arms the schedule on success. The most recent
    /// `/start` wins the destination; the schedule is only armed once.
    async fn handle_start(&self, chat_id: ChatId) {
        info!(chat_id, "received /start");
        self.pipeline.lock().await.dispatcher.bind(chat_id);
        self.reply(chat_id, GREETING).await;

        match self.creds.acquire().await {
            Ok(_) => {
                self.reply(chat_id, AUTH_SUCCESS).await;
                self.scheduler.arm();
            }
            Err(err) => {
                error!(error = %err, "authorization failed during /start");
                self.reply(chat_id, &format!("❌ Could not connect to Gmail: {err}"))
                    .await;
            }
        }
    }

    async fn handle_check(&self, chat_id: ChatId) {
        info!(chat_id, "received /check");
        self.reply(chat_id, CHECKING).await;
        self.scheduler.trigger_once().await;
    }

    async fn reply(&self, chat_id: ChatId, text: &str) {
        if let Err(err) = self.telegram.send_message(chat_id, text).await {
            error!(chat_id, error = %err, "failed to send reply");
        }
    }
}

/// Extracts the leading command from message text, dropping the `@BotName`
/// suffix used in group chats.
fn command_name(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    Some(first.split('@').next().unwrap_or(first))
}
