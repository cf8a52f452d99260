//! jailwardend - fail2ban jail reconciliation and control daemon.

use jailwarden::config::{Config, LogFormat, validation};
use jailwarden::http::{self, AppState};
use jailwarden::push::PushClient;
use jailwarden::{Engine, metrics};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "jailwarden.toml".to_string());

    let config = Config::load(&config_path);

    // Initialize tracing; the format comes from config, so fall back to text
    // when the file itself is broken.
    let format = config
        .as_ref()
        .map(|c| c.server.log_format)
        .unwrap_or_default();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }

    let config = config.map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    if let Err(errors) = validation::validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        return Err(anyhow::anyhow!(
            "configuration has {} error(s); refusing to start",
            errors.len()
        ));
    }

    info!(
        server = %config.server.name,
        listen = %config.server.listen,
        backend = ?config.daemon.backend,
        "Starting jailwardend"
    );

    if config.api.token.is_none() {
        warn!("No [api] token set: control routes are open to anyone who can reach the API");
    }
    warn!(
        "Agents are trusted on first push: an unknown agent id registers with whatever secret it presents"
    );

    // Metrics are optional.
    // Convention: metrics_port = 0 disables the HTTP endpoint (used by tests).
    let metrics_port = config.server.metrics_port.unwrap_or(9090);
    if metrics_port == 0 {
        info!("Metrics disabled");
    } else {
        metrics::init();
        info!("Metrics initialized");

        tokio::spawn(async move {
            http::run_metrics_server(metrics_port).await;
        });
        info!(port = metrics_port, "Prometheus HTTP server started");
    }

    let engine = Engine::from_config(&config).await.map_err(|e| {
        error!(error = %e, "Failed to initialize engine");
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Cache sweep and limiter maintenance
    {
        let engine = engine.clone();
        let mut shutdown = shutdown_rx.clone();
        let period = std::time::Duration::from_secs(config.cache.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        engine.sweep();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
    info!("Cache sweep task started");

    // Agent mode
    if let Some(push) = config.push.clone() {
        let client = PushClient::new(push);
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(client.run(engine, shutdown));
    }

    let listener = TcpListener::bind(config.server.listen).await.map_err(|e| {
        error!(addr = %config.server.listen, error = %e, "Failed to bind API listener");
        e
    })?;
    info!(addr = %config.server.listen, "API listening");

    let state = AppState::new(engine.clone(), config.api.token.clone());
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    };
    http::serve(listener, state, shutdown).await?;

    engine.shutdown().await;
    info!("jailwardend stopped");
    Ok(())
}
