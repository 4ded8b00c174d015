// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Parser;
use ethgate::config::GatewayNodeConfig;
use ethgate::node::run_gateway_node;
use ethgate_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayNodeConfig::load(&args.config_path)?;
    let prometheus_registry = prometheus::Registry::new();
    let cancel = CancellationToken::new();

    let handles = run_gateway_node(config, prometheus_registry, cancel.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received ctrl-c, shutting down");
    cancel.cancel();
    futures::future::try_join_all(handles)
        .await
        .map_err(|e| anyhow::anyhow!("Task join error: {}", e))?;
    Ok(())
}
