pub mod client;
pub mod types;

pub use client::{TelegramClient, TelegramError};
pub use types::{Chat, ChatId, IncomingMessage, Update};
