use clap::Parser;
use pgexporter::cache::Cache;
use pgexporter::config;
use pgexporter::error::StartupError;
use pgexporter::http::{self, AppState};
use pgexporter::logging::{self, LoggingCounters};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(author, version, about = "Prometheus exporter for PostgreSQL", long_about = None)]
struct Args {
    /// Main exporter configuration: host/port, servers, cache, TLS.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Custom-metric definitions, grafted onto the loaded configuration.
    #[arg(short = 'm', long = "metrics")]
    metrics: Option<PathBuf>,
}

async fn run(args: Args) -> Result<(), StartupError> {
    let mut config = config::load_config(&args.config)?;
    if let Some(metrics_path) = &args.metrics {
        config::load_metrics(&mut config, metrics_path)?;
    }

    let counters = Arc::new(LoggingCounters::default());
    logging::init(Arc::clone(&counters));

    let cache = Arc::new(Cache::new(
        config.cache.max_age,
        config.cache.max_size,
        config.metrics_port,
    ));

    let tls = config
        .tls
        .as_ref()
        .map(http::build_tls_acceptor)
        .transpose()
        .map_err(|err| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid TLS configuration: {err}"))
        })?;

    let addr = SocketAddr::new(config.host, config.metrics_port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, tls = tls.is_some(), "pgexporter listening");

    let state = Arc::new(AppState {
        config: Arc::new(config),
        cache,
        counters,
    });

    http::serve(state, listener, tls).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("pgexporter: {err}");
        let code = match err {
            StartupError::Config(_) => exitcode::CONFIG,
            StartupError::Bind(_) => exitcode::OSERR,
        };
        std::process::exit(code);
    }
}
