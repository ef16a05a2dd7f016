// SPDX-License-Identifier: Apache-2.0

//! Gateway daemon: wires the outer transport, the mux, the endpoint runners
//! and the inner clients together, then runs until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use portgate::clients::{CmClient, IamClient, MessageHandler};
use portgate::comm::CommManager;
use portgate::config::Config;
use portgate::endpoints::{CmConnection, IamConnection};
use portgate::logging;
use portgate::transport::{SocketTransport, StreamPairTransport, Transport};

/// Outer TCP port used when no inter-domain channel is configured.
const DEFAULT_SOCKET_PORT: u16 = 30001;

#[derive(Parser)]
#[command(
    name = "portgated",
    version,
    about = "Message-proxy gateway between an outer transport and the local IAM/CM services"
)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/portgate/config.json")]
    config: PathBuf,

    /// Start only the open endpoints, with no mutual TLS
    #[arg(short, long)]
    provisioning: bool,

    /// Emit JSON log lines for journal collection
    #[arg(short, long)]
    journal: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    verbose: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init(&args.verbose, args.journal);

    info!(version = env!("CARGO_PKG_VERSION"), "starting message proxy");

    let config = Config::from_file(&args.config).context("failed to load configuration")?;

    let transport: Arc<dyn Transport> = if config.vchan.rx_path.as_os_str().is_empty() {
        Arc::new(
            SocketTransport::bind(DEFAULT_SOCKET_PORT)
                .await
                .context("failed to bind outer socket")?,
        )
    } else {
        Arc::new(StreamPairTransport::new(&config.vchan))
    };

    let iam_client = IamClient::new(&config, args.provisioning)
        .await
        .context("failed to initialize iam client")?;
    let cm_client = CmClient::new(&config, iam_client.cert_provider(), args.provisioning)
        .await
        .context("failed to initialize cm client")?;

    let manager = CommManager::new(transport.clone());

    let cert_provider = (!args.provisioning).then(|| iam_client.cert_provider());
    let cm_connection = CmConnection::start(
        &config,
        cm_client.clone() as Arc<dyn MessageHandler>,
        &manager,
        cert_provider,
    )
    .context("failed to initialize cm connection")?;

    let iam_public =
        IamConnection::start(&manager, config.iam.open_port, iam_client.public_handler())
            .context("failed to initialize iam public connection")?;

    let iam_protected = match iam_client.protected_handler() {
        None => None,
        Some(handler) => Some(
            IamConnection::start_secure(
                &manager,
                config.iam.secure_port,
                handler,
                iam_client.cert_provider(),
                &config.vchan.iam_cert_storage,
                &config.ca_cert,
            )
            .context("failed to initialize iam protected connection")?,
        ),
    };

    wait_for_shutdown().await;

    info!("shutting down");

    transport.close().await.ok();
    manager.close().await.ok();

    cm_connection.close().await.ok();
    if let Some(connection) = &iam_protected {
        connection.close().await.ok();
    }
    iam_public.close().await.ok();

    cm_client.close().await.ok();
    iam_client.close().await.ok();

    info!("message proxy stopped");

    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
