//! HookRelay Server
//!
//! Receives webhooks from GitHub, Stripe and SendGrid, verifies them,
//! answers immediately and relays each event into the CRM sink in the
//! background.
//!
//! ## Configuration
//!
//! Settings come from a TOML file (`--config` / `HOOKRELAY_CONFIG`) and are
//! then overridden by environment variables such as `HOOKRELAY_BIND`,
//! `GITHUB_WEBHOOK_SECRET` or `SINK_USERNAME`. `RUST_LOG` controls the
//! log filter.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hr_api::create_router;
use hr_config::RelayConfig;
use hr_dispatch::Dispatcher;
use hr_integrations::IntegrationRegistry;
use hr_sink::{RestSinkTransport, SinkConnector};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hr-server")]
#[command(about = "HookRelay webhook relay server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "HOOKRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file and HOOKRELAY_BIND
    #[arg(long)]
    bind: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "HOOKRELAY_LOG_JSON")]
    log_json: bool,

    /// Log in to the sink at startup instead of on the first delivery
    #[arg(long, env = "HOOKRELAY_EAGER_CONNECT")]
    eager_connect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting HookRelay");

    let mut config = RelayConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    info!(
        bind = %config.server.bind,
        sink = %config.sink.login_url,
        api_version = %config.sink.api_version,
        "Configuration loaded"
    );

    let metrics = install_metrics();

    // One connector, and so one sink session, shared by every integration
    let transport = RestSinkTransport::new(config.sink.clone())?;
    let connector = Arc::new(SinkConnector::new(Arc::new(transport)));

    if args.eager_connect {
        match connector.ensure_connected().await {
            Ok(()) => info!("Connected to sink"),
            Err(e) => warn!(error = %e, "Sink login failed, will retry on first delivery"),
        }
    }

    let registry = IntegrationRegistry::from_config(&config.sources, connector.clone())?;
    for source in registry.sources() {
        info!(source = %source, "Integration registered");
    }

    let dispatcher = Arc::new(Dispatcher::new(registry));

    let app = create_router(dispatcher.clone(), metrics).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.bind).await?;
    info!(addr = %config.server.bind, "HookRelay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(in_flight = dispatcher.in_flight(), "Shutdown signal received, draining in-flight deliveries");
    let timeout = config.server.shutdown_timeout();
    if dispatcher.drain(timeout).await {
        info!("All deliveries finished");
    } else {
        warn!(
            in_flight = dispatcher.in_flight(),
            timeout_secs = timeout.as_secs(),
            "Exiting with deliveries still in flight"
        );
    }

    connector.disconnect();
    info!("HookRelay shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn install_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to install Prometheus recorder, /metrics disabled");
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
