//! # DMM Daemon
//!
//! Binds the RPC listener, rehydrates live requests from persistence, and
//! runs until a shutdown signal is received.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin dmm -- --config config.yaml
//! ```
//!
//! Press Ctrl+C to stop gracefully — in-flight orchestrator jobs run to
//! completion, then persistence is flushed before exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dmm::coordinator::Coordinator;
use dmm::metrics_adapter::{MetricsAdapter, MockMetricsAdapter, PrometheusMetricsAdapter};
use dmm::persistence::{MockPersistenceStore, PersistenceStore, PostgresStore};
use dmm::sdn_adapter::{HttpSdnAdapter, MockSdnAdapter, SdnAdapter};
use dmm::settings::Settings;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dmm", about = "Data Movement Manager")]
struct Cli {
    /// Path to the YAML configuration document.
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Number of orchestrator jobs allowed to run concurrently.
    #[arg(short = 'n', long = "n_workers", default_value_t = 4)]
    n_workers: usize,

    /// Log verbosity, e.g. "info" or "dmm=debug,tower=warn".
    #[arg(long = "loglevel", default_value = "info")]
    loglevel: String,

    /// Optional path to write logs to, in addition to stderr.
    #[arg(long = "logfile")]
    logfile: Option<PathBuf>,

    /// Run against in-memory mock adapters instead of a real SENSE
    /// controller, Prometheus, and Postgres. Intended for local trials and
    /// the scenario test suite's manual counterpart.
    #[arg(long = "mock-adapters")]
    mock_adapters: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.loglevel, cli.logfile.as_deref());

    #[cfg(feature = "observability")]
    {
        dmm::metrics::describe_metrics();
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        if let Err(e) = builder.install() {
            error!(error = %e, "failed to install Prometheus metrics exporter");
        }
    }

    let settings = Settings::load(&cli.config)?;
    info!(path = %cli.config.display(), "configuration loaded");

    let (sdn, metrics, store): (Arc<dyn SdnAdapter>, Arc<dyn MetricsAdapter>, Arc<dyn PersistenceStore>) =
        if cli.mock_adapters {
            (Arc::new(MockSdnAdapter::new()), Arc::new(MockMetricsAdapter::new()), Arc::new(MockPersistenceStore::new()))
        } else {
            let sdn = Arc::new(HttpSdnAdapter::new(settings.sense.base_url.clone()));
            let metrics = Arc::new(PrometheusMetricsAdapter::new(&settings.prometheus.host, settings.prometheus.port));
            let store = Arc::new(PostgresStore::connect(&settings.database_url()).await?);
            (sdn, metrics, store)
        };

    let coordinator = Arc::new(Coordinator::new(&settings, sdn, metrics, store, cli.n_workers)?);
    coordinator.rehydrate().await?;
    info!(n_workers = cli.n_workers, "coordinator ready");

    let run_coordinator = coordinator.clone();
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = run_coordinator.run().await {
            error!(error = %e, "RPC listener exited");
        }
    });

    info!("DMM is running; press Ctrl+C to stop gracefully");
    signal::ctrl_c().await?;
    info!("shutdown signal received, draining in-flight work");

    listener_handle.abort();
    coordinator.shutdown().await;
    info!("shutdown complete");

    Ok(())
}

fn init_logging(loglevel: &str, logfile: Option<&std::path::Path>) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(loglevel).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("logfile path must be writable");
            subscriber.with_writer(file).init();
        }
        None => subscriber.init(),
    }
}
