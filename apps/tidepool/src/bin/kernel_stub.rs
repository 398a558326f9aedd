//! Minimal remote-kernel entrypoint: connects back to the notebook server,
//! identifies its channels, answers requests until told to shut down. It
//! evaluates nothing; integration tests and local smoke runs deploy it in
//! place of a real kernel.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tidepool::config::runtime_config;
use tidepool::kernel::ENV_REMOTE_ADDRESS;
use tidepool::protocol::{RemoteRequest, RemoteResponse};
use tidepool::transport::{TransportClient, TransportError, socket};

#[derive(Parser, Debug)]
#[command(name = "kernel-stub")]
struct Cli {
    /// Notebook server transport address; falls back to TIDEPOOL_REMOTE_ADDRESS.
    #[arg(long)]
    connect: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    let addr = match cli.connect {
        Some(addr) => addr,
        None => std::env::var(ENV_REMOTE_ADDRESS)
            .context("no --connect flag and TIDEPOOL_REMOTE_ADDRESS unset")?
            .parse()
            .context("invalid TIDEPOOL_REMOTE_ADDRESS")?,
    };

    let client = Arc::new(socket::connect(addr, runtime_config()).await?);
    info!(server = %addr, "kernel stub connected");

    // Drain notebook updates so the channel never backs up.
    let updates_task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            while let Ok(Some(update)) = client.next_update().await {
                info!(?update, "notebook update received");
            }
        })
    };

    loop {
        let request = match client.next_request().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "request stream failed");
                break;
            }
        };
        let done = request.is_shutdown();
        if let Err(err) = respond(&client, request).await {
            warn!(error = %err, "failed to send response");
            break;
        }
        if done {
            info!("shutdown requested");
            break;
        }
    }

    client.close().await;
    let _ = updates_task.await;
    info!("kernel stub exiting");
    Ok(())
}

async fn respond(
    client: &TransportClient,
    request: RemoteRequest,
) -> Result<(), TransportError> {
    match request {
        RemoteRequest::StartKernel { req_id } => {
            client
                .send_response(&RemoteResponse::KernelStarted { req_id })
                .await
        }
        RemoteRequest::QueueCell {
            req_id,
            cell_id,
            code,
        } => {
            // Status brackets the evaluation, as a real kernel would report.
            client
                .send_response(&RemoteResponse::KernelStatus { busy: true })
                .await?;
            client
                .send_response(&RemoteResponse::ResultValue {
                    req_id,
                    cell_id,
                    mime: "text/plain".to_string(),
                    data: code.into_bytes(),
                })
                .await?;
            client
                .send_response(&RemoteResponse::KernelStatus { busy: false })
                .await
        }
        RemoteRequest::CancelAll { req_id } => {
            client
                .send_response(&RemoteResponse::UnitComplete { req_id })
                .await
        }
        RemoteRequest::Shutdown { req_id } => {
            client
                .send_response(&RemoteResponse::ShutdownAck { req_id })
                .await
        }
    }
}
