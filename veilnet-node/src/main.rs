use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use veilnet_node::cli::Cli;
use veilnet_node::node::Node;
use veilnet_node::persistence::{load_or_generate_identity, Paths};

#[tokio::main]
async fn main() -> ExitCode {
    // Iroh-free here, but the wire crate's TLS wrapping still needs an
    // explicit rustls crypto provider installed before first use.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let json_logs = std::env::var("VEILNET_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("veilnet_node=info".parse().unwrap());
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is::<ConfigError>() => {
            tracing::error!(error = %e, "configuration error");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ConfigError(String);

async fn run(cli: Cli) -> anyhow::Result<()> {
    let bootstrap_peers = cli.bootstrap_peers().map_err(|e| ConfigError(e.to_string()))?;

    let base_dir = cli.resolved_base_dir();
    let paths = Paths::new(base_dir);
    paths.ensure_dirs()?;

    let identity = load_or_generate_identity(&paths).await?;
    let node_id = identity.node_id();
    println!("{}", hex(&node_id));
    tracing::info!(node_id = %veilnet_crypto::short_id(&node_id), "identity loaded");

    let cancel = CancellationToken::new();
    let node = Node::new(identity, paths, cancel.clone());

    let (advertise_host, advertise_port) = split_host_port(&cli.listen).map_err(ConfigError)?;
    node.set_advertised_addr(advertise_host, advertise_port).await;

    for peer in &bootstrap_peers {
        let node = node.clone();
        let host = peer.host.clone();
        let port = peer.port;
        tokio::spawn(async move {
            match node.connect(&host, port).await {
                Ok(id) => tracing::info!(peer = %veilnet_crypto::short_id(&id), %host, port, "bootstrap peer connected"),
                Err(e) => tracing::warn!(%host, port, error = %e, "bootstrap peer unreachable"),
            }
        });
    }

    node.spawn_background_tasks();

    let listen_addr = cli.listen.clone();
    let listener_node = node.clone();
    let listen_task = tokio::spawn(async move { listener_node.listen(&listen_addr).await });

    tokio::select! {
        result = listen_task => {
            result??;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested");
            cancel.cancel();
        }
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn split_host_port(addr: &str) -> Result<(String, u16), String> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| format!("--listen {addr:?} must be HOST:PORT"))?;
    let port: u16 = port.parse().map_err(|_| format!("--listen {addr:?} has an invalid port"))?;
    Ok((host.to_string(), port))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
