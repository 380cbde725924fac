use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shelf_scout::config::{AppConfig, LoggingConfig};
use shelf_scout::control::{ControlChannel, TelegramCommandSource};
use shelf_scout::fetcher::{Fetcher, HttpFetcher};
use shelf_scout::monitor::MonitorSettings;
use shelf_scout::notifications::{
    AlertSink, ConsoleTransport, DispatchSettings, LogAlertSink, MessageTransport, NotificationDispatcher,
    SubscriberRegistry, TelegramClient, TransportAlertSink,
};
use shelf_scout::proxy_pool::ProxyPool;
use shelf_scout::store::{SqliteStore, StateStore};
use shelf_scout::supervisor::{MonitorSupervisor, Watchdog, WatchdogSettings};
use shelf_scout::web::{self, AppState};

#[derive(Debug, Parser)]
#[command(name = "shelf-scout", version, about = "Watches store shelves and pings you when stock lands")]
struct Cli {
    /// Extra configuration file layered over config/default and config/local.
    #[arg(short, long, env = "SCOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    check_config: bool,
}

fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let (file_layer, guard) = match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.check_config {
        println!(
            "Configuration OK: {} target(s), {} subscriber(s), {} proxy route(s)",
            config.targets.len(),
            config.subscribers.len(),
            config.proxies.routes.len()
        );
        return Ok(());
    }

    let _log_guard = init_tracing(&config.logging);
    info!("Starting shelf-scout v{}", env!("CARGO_PKG_VERSION"));

    if config.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics.port))
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Metrics exported on port {}", config.metrics.port);
    }

    let store: Arc<dyn StateStore> = Arc::new(
        SqliteStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("failed to open database")?,
    );
    let pool = Arc::new(ProxyPool::from_config(&config.proxies));
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.upstream.clone())?);

    let telegram = match &config.telegram.bot_token {
        Some(token) => Some(Arc::new(TelegramClient::new(&config.telegram.api_base, token)?)),
        None => {
            warn!("No Telegram bot token configured, notifications will only be logged");
            None
        }
    };
    let transport: Arc<dyn MessageTransport> = match &telegram {
        Some(client) => client.clone() as Arc<dyn MessageTransport>,
        None => Arc::new(ConsoleTransport::new()),
    };
    let alerts: Arc<dyn AlertSink> = match &config.telegram.operator_chat {
        Some(chat) => Arc::new(TransportAlertSink::new(transport.clone(), chat.clone(), None)),
        None => Arc::new(LogAlertSink),
    };

    let subscribers = Arc::new(SubscriberRegistry::load(store.clone(), config.initial_subscribers()?).await?);

    let (supervisor, events) = MonitorSupervisor::new(
        fetcher,
        pool,
        store.clone(),
        MonitorSettings::from(&config.polling),
        config.supervisor.event_buffer,
    );
    let supervisor = Arc::new(supervisor);

    let dispatcher = Arc::new(NotificationDispatcher::new(
        transport.clone(),
        subscribers.clone(),
        store.clone(),
        alerts.clone(),
        DispatchSettings::from(&config.notifications),
    ))
    .spawn(events);

    let summary = supervisor.restore(config.initial_targets()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = vec![
        Watchdog::new(
            supervisor.clone(),
            alerts.clone(),
            WatchdogSettings::from(&config.supervisor),
        )
        .spawn(shutdown_rx.clone()),
    ];

    let control = Arc::new(ControlChannel::new(supervisor.clone(), subscribers.clone()));
    if let Some(client) = telegram {
        let source = Arc::new(TelegramCommandSource::new(
            client,
            control.clone(),
            &config.telegram.allowed_chats,
            config.telegram.poll_timeout_secs,
        ));
        background.push(source.spawn(shutdown_rx.clone()));
    }

    if config.server.enabled {
        let server = config.server.clone();
        let state = AppState::new(control.clone(), supervisor.clone());
        let shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = web::serve(&server, state, shutdown).await {
                error!("Control API stopped: {}", e);
            }
        }));
    }

    alerts
        .alert(&format!(
            "🔭 New monitoring session! Watching {} target(s) for {} subscriber(s).",
            summary.started,
            subscribers.len().await
        ))
        .await;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let _ = shutdown_tx.send(true);
    supervisor.shutdown().await;
    // undelivered events stay in the outbox and are replayed on the next start
    dispatcher.abort();
    futures::future::join_all(background).await;

    alerts
        .alert("👋 This bot is done scouting the shelves, goodbye!")
        .await;
    Ok(())
}
