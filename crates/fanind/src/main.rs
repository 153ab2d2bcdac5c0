//! fanind — the Fanin daemon.
//!
//! Assembles the aggregator for an in-cluster deployment:
//! - Namespace from the service-account mount
//! - Cluster API client (endpoint discovery + node proxy)
//! - Plain HTTP client for state and node-exporter scrapes
//! - Aggregation engine and HTTP API
//!
//! # Usage
//!
//! ```text
//! fanind serve --config /etc/fanin/fanin.toml
//! fanind config --config /etc/fanin/fanin.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fanin_api::{AppContext, build_router};
use fanin_core::{FaninConfig, load_namespace};
use fanin_scrape::{AggregationEngine, HttpClient, KubeClient};

#[derive(Parser)]
#[command(name = "fanind", about = "Fanin metrics aggregation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the aggregated metrics document.
    Serve {
        /// Path to fanin.toml. Built-in defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to listen on, overriding `server.listen`.
        #[arg(long)]
        listen: Option<String>,

        /// Namespace file, overriding `cluster.namespace_file`.
        #[arg(long)]
        namespace_file: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            namespace_file,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(path) = namespace_file {
                config.cluster.namespace_file = path;
            }
            config.validate()?;
            run_serve(config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fanind=debug,fanin_api=debug,fanin_scrape=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FaninConfig> {
    let config = match path {
        Some(path) => FaninConfig::from_file(path)?,
        None => FaninConfig::default(),
    };
    Ok(config)
}

async fn run_serve(config: FaninConfig) -> anyhow::Result<()> {
    info!("fanin daemon starting");

    // ── Startup inputs ─────────────────────────────────────────

    let namespace = load_namespace(&config.cluster.namespace_file)
        .context("reading namespace")?;
    info!(%namespace, "namespace loaded");

    let cluster = Arc::new(
        KubeClient::in_cluster(&config.cluster).context("building cluster API client")?,
    );
    info!(?cluster, "cluster API client initialized");

    // ── Aggregation engine ─────────────────────────────────────

    let engine = AggregationEngine::from_config(&config, Arc::new(HttpClient::new()), cluster)?;
    info!(
        service = %engine.registry().service(),
        state_url = %engine.options().state_url,
        fan_out = engine.options().fan_out,
        policy = ?engine.options().failure_policy,
        "aggregation engine initialized"
    );

    // ── API server ─────────────────────────────────────────────

    let router = build_router(AppContext::new(engine, namespace));
    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {:?}", config.server.listen))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("fanin daemon stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
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
    info!("shutdown signal received");
}
