use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telegram: TelegramConfig,
    pub gmail: GmailConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    /// Durable OAuth token record, read on every acquire and rewritten
    /// after each refresh or authorization.
    pub token_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_scopes() -> Vec<String> {
    vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()]
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_page_size() -> u32 {
    10
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            let port: u16 = port.parse().map_err(ConfigError::InvalidPort)?;
            self.app.port = port;
        }

        if let Ok(token) = env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.telegram.bot_token)?;
        apply_env_marker(&mut self.gmail.client_id)?;
        apply_env_marker(&mut self.gmail.client_secret)?;
        for scope in &mut self.gmail.scopes {
            apply_env_marker(scope)?;
        }
        apply_env_marker_path(&mut self.paths.token_file)?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        let token_string = self.paths.token_file.to_string_lossy().to_string();
        let token_file = shellexpand::tilde(&token_string);
        self.paths.token_file = PathBuf::from(token_file.as_ref());
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
