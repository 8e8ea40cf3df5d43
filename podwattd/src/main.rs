mod systemd;

use anyhow::Result;
use clap::Parser;
use podwatt_core::{config::Config, run_daemon, run_once, ReadyCallback, StatusCallback};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "podwattd", about = "Per-workload energy accounting daemon")]
struct Args {
    /// Путь к конфигу
    #[arg(short, long, default_value = "/etc/podwatt/podwatt.yml")]
    config: String,

    /// Выполнить один цикл и вывести состояние в JSON
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load(&args.config)?;

    if args.once {
        let snapshot = run_once(config).await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    tracing::info!(
        "Starting podwatt daemon (sample period {}ms)",
        config.sample_period_ms
    );

    // Канал для graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let on_ready: ReadyCallback = Box::new(|| {
        if let Err(e) = systemd::notify_ready() {
            tracing::debug!("systemd notify skipped: {:#}", e);
        }
    });
    let on_status: StatusCallback = Box::new(|status: &str| systemd::notify_status(status));

    run_daemon(config, shutdown_rx, Some(on_ready), Some(on_status)).await
}
