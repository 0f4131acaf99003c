//! chartpilot operator binary

use clap::Parser;
use kube::Client;
use miette::Result;
use tracing::{error, info};

use chartpilot::{Cli, Error, Operator, OperatorConfig, load_watches, logging};

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();

    let config = OperatorConfig::try_from(Cli::parse())?;
    logging::init(config.log_format)?;

    run(config).await?;
    Ok(())
}

async fn run(config: OperatorConfig) -> Result<(), Error> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting chartpilot");

    let watches = load_watches(&config.watches_file)?;
    let client = Client::try_default().await.map_err(Error::Client)?;
    info!(
        watches = watches.len(),
        scope = config.namespace.as_deref().unwrap_or("cluster-wide"),
        "connected to Kubernetes cluster"
    );

    let operator = Operator::start(client, &config, watches).await?;

    shutdown_signal().await;
    info!(grace = ?config.shutdown_grace_period, "shutting down");
    operator.shutdown(config.shutdown_grace_period).await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
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
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
