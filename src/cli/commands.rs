use crate::cli::{Commands, RunArgs};
use crate::config::Config;
use crate::k8s::{K8sClient, Lookup};
use crate::lifecycle::Moss;
use crate::source::SocketSource;
use anyhow::{Context, Result};
use moss_common::Ip;
use std::path::Path;
use tracing::info;

pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> Result<()> {
    match command {
        Commands::Run(args) => handle_run(load_config(config_path, &args)?).await,
        Commands::Resolve { ip, args } => {
            handle_resolve(ip, load_config(config_path, &args)?).await
        }
    }
}

fn load_config(path: Option<&Path>, args: &RunArgs) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn connect(config: &Config) -> Result<kube::Client> {
    let client = K8sClient::connect(config.credentials, config.kubeconfig.as_deref())
        .await
        .context("Failed to connect to the Kubernetes API")?;
    Ok(client.client())
}

async fn handle_run(config: Config) -> Result<()> {
    let client = connect(&config).await?;
    let mut moss = Moss::new(config)?;

    let source = SocketSource::bind(moss.config().ingest_address, moss.correlator().stats())
        .await
        .context("Failed to open the connection record listener")?;

    moss.start(client, Box::new(source)).await?;
    moss.run_until(shutdown_signal()).await?;
    Ok(())
}

async fn handle_resolve(ip: Ip, config: Config) -> Result<()> {
    let client = connect(&config).await?;
    let timeout = config.ready_timeout();
    let mut moss = Moss::new(config)?;

    moss.start_directory(client)?;
    info!("Waiting up to {:?} for the directory to sync", timeout);
    let ready = moss.wait_ready(timeout).await;

    let directory = moss.directory();
    let lookup = directory.lookup(ip);
    let workload = directory.resolve(ip);
    moss.stop().await;
    ready?;

    match lookup {
        Lookup::Hit(_) => println!("{}\t{}", ip, workload),
        Lookup::Miss | Lookup::NotReady => {
            println!("{}\t{} (no direct owner)", ip, workload)
        }
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
