use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, routing::get};
use mailwatch_core::gmail::{CredentialStore, GmailClient};
use mailwatch_core::telegram::TelegramClient;
use mailwatch_core::{
    Bot, Config, MailPoller, NotificationDispatcher, Pipeline, Scheduler, init_telemetry,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    init_telemetry(&config.app)?;

    let http = reqwest::Client::new();

    let creds = Arc::new(CredentialStore::new(
        http.clone(),
        &config.gmail.client_id,
        &config.gmail.client_secret,
        config.gmail.scopes.clone(),
        config.paths.token_file.clone(),
    ));
    let gmail = GmailClient::new(http.clone(), "me");
    let telegram = Arc::new(TelegramClient::new(http.clone(), &config.telegram.bot_token));

    let pipeline = Arc::new(Mutex::new(Pipeline {
        poller: MailPoller::new(gmail, creds.clone(), config.gmail.page_size),
        dispatcher: NotificationDispatcher::new(telegram.clone()),
    }));

    let shutdown = CancellationToken::new();
    // Armed lazily by the first /start, not at startup.
    let scheduler = Arc::new(Scheduler::new(
        pipeline.clone(),
        Duration::from_secs(config.gmail.poll_interval_secs),
        shutdown.child_token(),
    ));

    let bot = Arc::new(Bot::new(telegram, pipeline, scheduler, creds));
    let bot_handle = tokio::spawn(bot.run(shutdown.child_token()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("mailwatch listening on {}", listener.local_addr()?);

    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = bot_handle.await;
    Ok(())
}

fn router() -> Router {
    Router::new().route("/", get(liveness))
}

async fn liveness() -> &'static str {
    "running"
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }

    shutdown.cancel();
}
