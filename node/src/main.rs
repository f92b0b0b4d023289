// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tessera Node
//!
//! Entry point for the `tessera-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts a service node on the chosen
//! transport, and serves the status API and Prometheus metrics.
//!
//! - `run`     — start the node and serve until interrupted
//! - `publish` — start a node, publish one text note, print the result
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod note;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use tessera_network::config::{IO_POOL_SHUTDOWN_GRACE, PROTOCOL_VERSION, PROTOCOL_VERSION_STRING};
use tessera_network::crypto::KeyPair;
use tessera_network::{Address, IoPool, NetworkConfig, ServiceNode};

use cli::{Commands, TesseraNodeCli};
use metrics::{MetricsListener, NodeMetrics};
use note::TextNote;

/// How often the connection gauge is refreshed.
const PEER_GAUGE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TesseraNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Publish(args) => publish_note(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the node and serves the status API and metrics until a shutdown
/// signal arrives.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.node.log_format());
    let config = args.node.network_config()?;
    let keypair = load_keypair(args.key.as_deref())?;

    tracing::info!(
        node_id = %config.node_id,
        transport = %config.transport_type,
        p2p_port = config.port,
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        publisher = %keypair.public_key(),
        "starting tessera-node"
    );

    // --- Metrics ---
    let node_metrics = Arc::new(
        NodeMetrics::new().map_err(|e| anyhow::anyhow!("failed to create metrics: {}", e))?,
    );

    // --- Network ---
    let io_pool = Arc::new(IoPool::new("network", config.io_pool_size));
    let node = Arc::new(start_service_node(config, &io_pool).await?);
    node.data_service()
        .add_listener(Arc::new(MetricsListener::new(Arc::clone(&node_metrics))));
    connect_seeds(&node, &args.node.seeds).await;

    // --- API server ---
    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        node: Arc::clone(&node),
        keypair: Arc::new(keypair),
        metrics: Arc::clone(&node_metrics),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("status API listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Peer gauge ---
    let gauge_node = Arc::clone(&node);
    let gauge_metrics = Arc::clone(&node_metrics);
    let peer_gauge = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PEER_GAUGE_INTERVAL);
        loop {
            interval.tick().await;
            let peer_group = gauge_node.peer_group();
            gauge_metrics
                .connected_peers
                .set(peer_group.num_connections() as i64);
            if peer_group.is_below_target() {
                tracing::debug!(
                    connections = peer_group.num_connections(),
                    target = peer_group.config().min_connections,
                    "peer group below target"
                );
            }
        }
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    peer_gauge.abort();
    node.shutdown().await;
    io_pool.shutdown(IO_POOL_SHUTDOWN_GRACE).await;
    tracing::info!("tessera-node stopped");
    Ok(())
}

/// Starts a node, waits for its seed connections, publishes one note and
/// prints the broadcast result as JSON on stdout.
async fn publish_note(args: cli::PublishArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.node.log_format());
    let config = args.node.network_config()?;
    let keypair = load_keypair(args.key.as_deref())?;

    let io_pool = Arc::new(IoPool::new("network", config.io_pool_size));
    let node = start_service_node(config, &io_pool).await?;
    connect_seeds(&node, &args.node.seeds).await;
    tokio::time::sleep(Duration::from_millis(args.settle_ms)).await;

    let outcome = node
        .data_service()
        .add_network_payload(&TextNote::new(args.text), &keypair)
        .await
        .context("failed to publish note");

    node.shutdown().await;
    io_pool.shutdown(IO_POOL_SHUTDOWN_GRACE).await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn start_service_node(config: NetworkConfig, io_pool: &Arc<IoPool>) -> Result<ServiceNode> {
    let node_id = config.node_id.clone();
    ServiceNode::start_with_kinds(config, Arc::clone(io_pool), vec![TextNote::policy()])
        .await
        .with_context(|| format!("failed to start node {}", node_id))
}

/// Dials every seed. Failures are logged and skipped.
async fn connect_seeds(node: &ServiceNode, seeds: &[Address]) {
    for seed in seeds {
        if seed == node.address() {
            continue;
        }
        match node.connect_to(seed).await {
            Ok(connection) => tracing::info!(
                seed = %seed,
                peer_node = connection.peer_node_id(),
                "connected to seed"
            ),
            Err(e) => tracing::warn!(seed = %seed, error = %e, "seed unreachable"),
        }
    }
}

fn load_keypair(hex_key: Option<&str>) -> Result<KeyPair> {
    match hex_key {
        Some(key) => KeyPair::from_hex(key).context("invalid publisher key"),
        None => {
            let keypair = KeyPair::generate();
            tracing::info!(
                public_key = %keypair.public_key(),
                "no publisher key given, generated one"
            );
            Ok(keypair)
        }
    }
}

fn print_version() {
    println!("tessera-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {} ({})", PROTOCOL_VERSION, PROTOCOL_VERSION_STRING);
    println!("rustc        {}", rustc_version());
}

fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
