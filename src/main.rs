//! Prometheus exporter for Mosquitto broker telemetry.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use mosquitto_exporter::{
    ExporterConfig, HttpServer, MetricRegistry, MqttCollector, TopicTables,
};

/// Prometheus exporter for Mosquitto broker telemetry.
#[derive(Parser, Debug)]
#[command(name = "mosquitto-exporter")]
#[command(about = "Export Mosquitto $SYS broker telemetry as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration and exit.
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };

    // Environment overrides, then CLI overrides
    config.apply_env_overrides();

    if let Some(listen) = args.listen {
        config.http.listen = listen;
    }

    config.validate()?;

    if args.show_config {
        println!("{}", config.display());
        return Ok(());
    }

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("mosquitto_exporter={}", log_level).parse()?)
        .add_directive(format!("rumqttc={}", Level::WARN).parse()?);

    match config.logging.format {
        mosquitto_exporter::config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        mosquitto_exporter::config::LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    info!(
        broker = %config.mosquitto.broker_url,
        listen = %config.http.listen,
        "Starting Mosquitto exporter"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the registry and classification tables
    let registry = Arc::new(MetricRegistry::new());
    let tables = Arc::new(TopicTables::mosquitto());

    // Parse listen address
    let listen_addr = config
        .http
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Create components
    let collector = MqttCollector::new(config.mosquitto.clone(), tables, registry.clone());
    let http_server = HttpServer::new(registry.clone(), listen_addr, config.http.path.clone());

    // Start collector
    let collector_shutdown = shutdown_rx.clone();
    let collector_task = tokio::spawn(async move {
        if let Err(e) = collector.run(collector_shutdown).await {
            error!("Collector error: {}", e);
        }
    });

    // Start HTTP server
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).unwrap();
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = collector_task.await;
        let _ = http_task.await;
    })
    .await;

    // Print final stats
    let stats = registry.stats();
    info!(
        messages_routed = stats.messages_routed,
        messages_ignored = stats.messages_ignored,
        series_count = registry.series_count(),
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}
