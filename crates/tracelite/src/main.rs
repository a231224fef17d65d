mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use tracelite_api::ApiState;
use tracelite_core::config::{ApiConfig, CollectorConfig, parse_listen_addr};
use tracelite_ingest::Reconstructor;
use tracelite_ingest::server::IngestState;
use tracelite_ingest::tls::load_rustls_config;
use tracelite_store::Store;

#[derive(Parser, Debug)]
#[command(name = "tracelite")]
#[command(about = "Log-driven trace reconstruction: TLS collector and read API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run the TLS ingest collector")]
    Collector {
        #[arg(long)]
        addr: Option<String>,
        #[arg(long)]
        clickhouse_dsn: Option<String>,
        #[arg(long)]
        clickhouse_db: Option<String>,
        #[arg(long)]
        trace_window: Option<String>,
        #[arg(long)]
        flush_interval: Option<String>,
    },
    #[command(about = "Run the read API")]
    Api {
        #[arg(long)]
        addr: Option<String>,
        #[arg(long)]
        clickhouse_dsn: Option<String>,
        #[arg(long)]
        clickhouse_db: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Collector {
            addr,
            clickhouse_dsn,
            clickhouse_db,
            trace_window,
            flush_interval,
        } => {
            run_collector(addr, clickhouse_dsn, clickhouse_db, trace_window, flush_interval).await
        }
        Commands::Api {
            addr,
            clickhouse_dsn,
            clickhouse_db,
        } => run_api(addr, clickhouse_dsn, clickhouse_db).await,
    }
}

async fn run_collector(
    addr: Option<String>,
    clickhouse_dsn: Option<String>,
    clickhouse_db: Option<String>,
    trace_window: Option<String>,
    flush_interval: Option<String>,
) -> anyhow::Result<()> {
    let mut cfg = CollectorConfig::from_env().context("load collector config")?;
    if let Some(v) = addr {
        cfg.addr = v;
    }
    if let Some(v) = clickhouse_dsn {
        cfg.clickhouse_dsn = v;
    }
    if let Some(v) = clickhouse_db {
        cfg.clickhouse_db = v;
    }
    if let Some(v) = trace_window {
        cfg.trace_window = humantime::parse_duration(&v).context("parse --trace-window")?;
    }
    if let Some(v) = flush_interval {
        cfg.flush_interval = humantime::parse_duration(&v).context("parse --flush-interval")?;
    }

    let store = Store::new(&cfg.clickhouse_dsn, &cfg.clickhouse_db, Duration::from_secs(30))?;
    let recon = Arc::new(Reconstructor::new(
        store.clone(),
        cfg.trace_window,
        cfg.flush_interval,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush_task = tokio::spawn({
        let recon = recon.clone();
        async move { recon.run(shutdown_rx).await }
    });

    let app = tracelite_ingest::server::router(IngestState {
        token: cfg.ingest_token.clone(),
        store,
        recon: recon.clone(),
    });

    let tls = load_rustls_config(&cfg).await?;
    let listen = parse_listen_addr(&cfg.addr)?;
    let handle = axum_server::Handle::new();

    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal().await;
            info!("shutting down, draining requests");
            let _ = shutdown_tx.send(true);
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        }
    });

    info!(addr = %listen, store = %cfg.clickhouse_dsn, db = %cfg.clickhouse_db, "collector listening");
    axum_server::bind_rustls(listen, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("collector server")?;

    flush_task.await.context("join flush loop")?;
    // One last pass over traces that aged out while draining.
    recon.flush_now().await;
    Ok(())
}

async fn run_api(
    addr: Option<String>,
    clickhouse_dsn: Option<String>,
    clickhouse_db: Option<String>,
) -> anyhow::Result<()> {
    let mut cfg = ApiConfig::from_env().context("load api config")?;
    if let Some(v) = addr {
        cfg.addr = v;
    }
    if let Some(v) = clickhouse_dsn {
        cfg.clickhouse_dsn = v;
    }
    if let Some(v) = clickhouse_db {
        cfg.clickhouse_db = v;
    }

    let store = Store::new(&cfg.clickhouse_dsn, &cfg.clickhouse_db, Duration::from_secs(20))?;
    let app = tracelite_api::router(ApiState { store });

    let listen = parse_listen_addr(&cfg.addr)?;
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .context("bind api listener")?;

    info!(addr = %listen, store = %cfg.clickhouse_dsn, db = %cfg.clickhouse_db, "api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("api server")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
