use std::sync::Arc;

use clap::Parser;
use policy_agent::config::{Cli, Commands, NodeConfig};
use policy_agent::dataplane::MemoryDataplane;
use policy_agent::metrics::ServerMetrics;
use policy_agent::server::Server;
use policy_agent::{Result, http};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent(args) => {
            setup_subscriber();

            let config = NodeConfig::try_from_args(&args)?;
            let dp = Arc::new(MemoryDataplane::new());
            let (ready_tx, ready) = watch::channel(false);
            // the handle stays alive so attach, detach and tunnel events can be wired in
            let (server, _handle) =
                Server::new(dp, config, ready_tx, ServerMetrics::registered())?;

            let cancel = CancellationToken::new();
            let mut metrics_handle = tokio::spawn(http::serve_metrics(
                args.metrics_address,
                ready,
                cancel.child_token(),
            ));
            let mut server_handle = tokio::spawn(server.serve(cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            tokio::select! {
                h = &mut metrics_handle => exit("metrics", h),
                h = &mut server_handle => exit("server", h),
                _ = &mut shutdown_handle => {
                        cancel.cancel();
                        let (metrics, server) = tokio::join!(metrics_handle, server_handle);
                        if let Err(m) = metrics {
                            error!("metrics exited with error: {m}");
                        }
                        if let Err(s) = server {
                            error!("server exited with error: {s}");
                        }
                    },
            };
            info!("Exiting...");
        }
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "policy_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl_c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
