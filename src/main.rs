use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use chat_relay::clock::SystemClock;
use chat_relay::config::RelayConfig;
use chat_relay::health::health_routes;
use chat_relay::monitor::SysinfoProbe;
use chat_relay::notify::{LogNotifier, Notifier, OperatorAlerts, TransportNotifier};
use chat_relay::rules::TaskCache;
use chat_relay::store::{LibSqlTaskStore, TaskStore};
use chat_relay::supervisor::{ExitReason, RelayParts, Supervisor};
use chat_relay::transport::{TelegramTransport, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let config = RelayConfig::from_env().context("Invalid configuration")?;

    // Held until exit so buffered file logs are flushed.
    let _log_guard = init_tracing(config.log_file.as_deref());

    eprintln!("📡 Chat Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!(
        "   Workers: {}, queue capacity: {}",
        config.workers.workers, config.queue.capacity
    );

    let reason = run(config).await?;
    Ok(ExitCode::from(reason.exit_code()))
}

async fn run(config: RelayConfig) -> anyhow::Result<ExitReason> {
    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlTaskStore::new_local(&config.database_path)
            .await
            .with_context(|| {
                format!("Failed to open database at {}", config.database_path.display())
            })?,
    );

    // ── Transport ───────────────────────────────────────────────────────
    let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new(&config.telegram));
    if let Err(e) = transport.health_check().await {
        warn!(error = %e, "Transport health check failed, continuing");
    }

    let notifier: Arc<dyn Notifier> = match config.telegram.admin_chat {
        Some(chat) => {
            eprintln!("   Alerts: admin chat {chat}");
            Arc::new(TransportNotifier::new(transport.clone(), chat))
        }
        None => {
            eprintln!("   Alerts: log only (RELAY_ADMIN_CHAT_ID not set)");
            Arc::new(LogNotifier)
        }
    };

    // ── Rules ───────────────────────────────────────────────────────────
    let cache = Arc::new(TaskCache::new(store.clone()));
    let loaded = cache
        .reload()
        .await
        .context("Failed to load forwarding rules")?;
    eprintln!("   Rules: {loaded} active");

    let supervisor = Supervisor::start(
        &config,
        RelayParts {
            store,
            transport,
            cache,
            alerts: OperatorAlerts::new(notifier),
            probe: Box::new(SysinfoProbe::new()),
            clock: Arc::new(SystemClock),
        },
    )
    .await;

    // ── Health ──────────────────────────────────────────────────────────
    if let Some(port) = config.health_port {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("Failed to bind health port {port}"))?;
        let app = health_routes(supervisor.handle());
        eprintln!("   Health: http://0.0.0.0:{port}/status\n");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Health server stopped");
            }
        });
    }

    let reason = supervisor.run(shutdown_signal()).await;
    info!(?reason, code = reason.exit_code(), "Exiting");
    Ok(reason)
}

fn init_tracing(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let prefix = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "relay.log".into());
            let appender = tracing_appender::rolling::daily(dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
