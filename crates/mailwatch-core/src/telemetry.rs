use std::sync::OnceLock;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::config::AppConfig;

static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Initialize structured logging (RUST_LOG driven). JSON lines are used for
/// production; pretty output for dev. Safe to call more than once.
pub fn init_telemetry(app: &AppConfig) -> Result<(), TelemetryError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let json_format = !app.env.eq_ignore_ascii_case("dev");
    let result = if json_format {
        let fmt_layer = fmt::layer().json().flatten_event(true);
        let subscriber = Registry::default().with(fmt_layer).with(env_filter);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .pretty()
            .with_writer(std::io::stderr);
        let subscriber = Registry::default().with(fmt_layer).with(env_filter);
        tracing::subscriber::set_global_default(subscriber)
    };

    result.map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;
    let _ = INSTALLED.set(());
    Ok(())
}

/// Basic logging initializer for binaries/tests that do not wire full config.
pub fn init_logging(env: &str) -> Result<(), TelemetryError> {
    let app = AppConfig {
        service_name: "mailwatch".to_string(),
        port: 0,
        env: env.to_string(),
    };
    init_telemetry(&app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_init_is_idempotent() {
        let app = AppConfig {
            service_name: "mailwatch".into(),
            port: 0,
            env: "prod".into(),
        };

        init_telemetry(&app).expect("telemetry initializes");
        init_telemetry(&app).expect("second init is a no-op");
    }
}
