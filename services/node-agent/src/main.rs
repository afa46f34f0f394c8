//! nodemesh Node Agent
//!
//! Joins this host to a cluster:
//!
//! - **Join**: submits a wrapped join key and waits for the issuer
//! - **Configure**: writes kubelet configuration and starts the kubelet
//! - **Mesh**: brings up the node's tunnel to the cluster ingress

use std::sync::Arc;

use anyhow::{Context, Result};
use nodemesh_crypto::JoinPublicKey;
use nodemesh_node_agent::{Config, CrictlHypervisor, HttpClusterClient, JoinFlow, Systemctl};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting nodemesh node agent");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        node_name = %config.join.node_name,
        api_server = %config.join.api_server,
        config_dir = %config.paths.config_dir.display(),
        "Configuration loaded"
    );

    let ca_pem = match &config.ca_cert_file {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("failed to read CA bundle {}", path.display()))?,
        ),
        None => None,
    };
    let api = HttpClusterClient::new(
        &config.join.api_server,
        config.join_token.clone(),
        ca_pem.as_deref(),
    )
    .context("failed to build cluster API client")?;
    let join_public_key = JoinPublicKey::from_base64(&config.join_public_key)
        .context("NODEMESH_JOIN_PUBLIC_KEY is not a valid public key")?;
    let hypervisor = CrictlHypervisor::new(
        config.join.node_name.clone(),
        config.join.container_runtime_endpoint.clone(),
        config.join.image_service_endpoint.clone(),
        config.paths.pods_dir(),
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut flow = JoinFlow::new(
        config.join.clone(),
        config.paths.clone(),
        join_public_key,
        Arc::new(api),
        Arc::new(hypervisor),
        Arc::new(Systemctl),
    );

    match flow.run(shutdown_rx).await {
        Ok(()) => {
            info!(node_name = %config.join.node_name, "Node joined");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, state = %flow.state(), "Node join failed");
            Err(e.into())
        }
    }
}
