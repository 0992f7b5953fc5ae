use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thawgate::config::Config;
use thawgate::docker::DockerRuntime;
use thawgate::gate::Gate;
use thawgate::pages::Pages;
use thawgate::server::{GateServer, PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("thawgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; a missing default file means all defaults
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("thawgate.toml"));

    let mut config = if explicit_path.is_some() {
        Config::load(&config_path)
    } else {
        Config::load_or_default(&config_path)
    }
    .map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_env().map_err(|e| {
        error!(error = %e, "Invalid environment override");
        e
    })?;

    if !config.enabled {
        info!("Gate not enabled, doing nothing. Set THAWGATE_ENABLED=true to enable it.");
        return Ok(());
    }

    let runtime = DockerRuntime::connect(config.runtime.docker_host.as_deref()).await?;
    info!("Connected to container runtime");

    let gate = Gate::new(Arc::new(runtime), &config);
    let report = gate.reload().await.map_err(|e| {
        error!(error = %e, "Initial container discovery failed");
        e
    })?;
    for skipped in &report.rejected {
        warn!(name = %skipped.name, reason = %skipped.reason, "Container skipped");
    }

    print_startup_banner(&config, report.loaded.len());

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pages = Pages::new(&config.server.pages_dir, config.server.style_variant);
    let server = GateServer::new(bind_addr, Arc::clone(&gate), pages, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gate server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or rediscovery (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, rediscovering containers...");
                    let gate = Arc::clone(&gate);
                    tokio::spawn(async move {
                        match gate.reload().await {
                            Ok(report) => {
                                info!(
                                    loaded = report.loaded.len(),
                                    rejected = report.rejected.len(),
                                    "Containers rediscovered"
                                );
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to rediscover containers");
                            }
                        }
                    });
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    gate.shutdown().await;

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, loaded: usize) {
    info!(name = PKG_NAME, version = VERSION, "Starting admission gate");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        pages_dir = %config.server.pages_dir,
        style_variant = config.server.style_variant,
        "Server configuration"
    );
    info!(
        freeze_method = %config.defaults.freeze_method,
        idle_timeout_ms = config.defaults.idle_timeout.as_millis() as u64,
        start_action = ?config.defaults.start_action,
        label_prefix = %config.labels.prefix,
        "Container defaults"
    );
    info!(
        call_timeout_ms = config.runtime.call_timeout.as_millis() as u64,
        retry_attempts = config.runtime.retry_attempts,
        "Runtime call policy"
    );
    info!(managed = loaded, "Managed containers");
}
