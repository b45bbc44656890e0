pub mod bot;
pub mod config;
pub mod gmail;
pub mod notifier;
pub mod poller;
pub mod scheduler;
pub mod seen;
pub mod telegram;
pub mod telemetry;

pub use bot::Bot;
pub use config::Config;
pub use gmail::{CredentialStore, GmailClient, OAuthTokens};
pub use notifier::NotificationDispatcher;
pub use poller::{MailPoller, MessageSummary, PollError};
pub use scheduler::{Pipeline, Scheduler, SharedPipeline};
pub use seen::SeenMessages;
pub use telegram::{TelegramClient, TelegramError};
pub use telemetry::{TelemetryError, init_logging, init_telemetry};
