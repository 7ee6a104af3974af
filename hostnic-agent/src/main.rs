use clap::Parser;
use hostnic_agent::{Result, config::AgentArgs, http, ipam};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    setup_subscriber();
    let args = AgentArgs::parse();

    let ready = CancellationToken::new();
    let cancel = CancellationToken::new();

    let mut metrics_handle = tokio::spawn(http::serve(
        args.metrics_address,
        ready.clone(),
        cancel.child_token(),
    ));
    let mut ipam_handle = tokio::spawn(ipam::run(args, ready, cancel.child_token()));
    let mut shutdown_handle = tokio::spawn(shutdown_signal());

    tokio::select! {
        h = &mut metrics_handle => exit("metrics", h)?,
        h = &mut ipam_handle => exit("ipamd", h)?,
        _ = &mut shutdown_handle => {
            info!("shutting down");
            cancel.cancel();
            let (metrics, ipamd) = tokio::join!(metrics_handle, ipam_handle);
            if let Err(e) = metrics {
                error!("metrics exited with error: {e}");
            }
            if let Err(e) = ipamd {
                error!("ipamd exited with error: {e}");
            }
        }
    }
    info!("exiting");
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostnic_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) -> Result<()> {
    match out {
        Ok(Ok(())) => {
            info!("{task} exited");
            Ok(())
        }
        Ok(Err(e)) => {
            // a failed bootstrap must fail process start so the
            // orchestrator restarts the daemon
            error!("{task} failed with error: {e}");
            Err(e)
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}");
            Err(hostnic_agent::Error::Other(e.to_string()))
        }
    }
}
