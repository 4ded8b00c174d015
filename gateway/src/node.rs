// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ethgate_pg_db::Db;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::account_pool::AccountPool;
use crate::config::GatewayNodeConfig;
use crate::crypto::KeyCipher;
use crate::eth_client::{ChainClient, EthClient};
use crate::listener::spawn_chain_listener;
use crate::metrics::GatewayMetrics;
use crate::notifier::WebhookNotifier;
use crate::payment::{ChainContext, PaymentEngine};
use crate::price::HttpPriceOracle;
use crate::retry_with_max_elapsed_time;
use crate::server::run_server;
use crate::storage::PgStore;
use crate::types::NetworkMode;

/// How long start-up keeps retrying an unreachable chain node.
const CHAIN_CONNECT_MAX_ELAPSED: Duration = Duration::from_secs(300);

pub async fn run_gateway_node(
    config: GatewayNodeConfig,
    prometheus_registry: prometheus::Registry,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let settings = config.validate()?;
    let metrics = Arc::new(GatewayMetrics::new(&prometheus_registry));
    let cipher = Arc::new(KeyCipher::new(&config.private_key_secret())?);

    let db = Db::for_write(Url::parse(&config.database_url)?, config.db.clone()).await?;
    let applied = db.run_migrations(&ethgate_schema::MIGRATIONS).await?;
    info!("Applied {} database migrations", applied.len());
    let store = Arc::new(PgStore::new(db));

    let mut clients: Vec<(NetworkMode, Arc<dyn ChainClient>)> = vec![];
    let mut contexts = vec![];
    for (mode, chain) in &settings.chains {
        let client = retry_with_max_elapsed_time!(
            EthClient::new(
                chain.rpc_url.as_str(),
                format!("eth-{}", mode),
                chain.expected_chain_id,
                metrics.clone(),
            ),
            CHAIN_CONNECT_MAX_ELAPSED
        )??;
        let client: Arc<dyn ChainClient> = Arc::new(client);
        let chain_id = client.chain_id().await?;
        contexts.push(ChainContext::new(
            *mode,
            chain_id,
            client.clone(),
            chain,
            &settings,
            store.clone(),
            cipher.clone(),
            metrics.clone(),
        ));
        clients.push((*mode, client));
    }

    let price_oracle = Arc::new(HttpPriceOracle::new(Url::parse(&config.price_service_url)?)?);
    let notifier = Arc::new(WebhookNotifier::new(Url::parse(&config.webhook_url)?)?);
    let pool = AccountPool::new(store.clone(), cipher, metrics.clone());
    let engine = Arc::new(PaymentEngine::new(
        settings.clone(),
        contexts,
        store.clone(),
        store,
        pool,
        price_oracle,
        notifier,
        metrics.clone(),
    ));

    let mut handles = vec![];
    for (mode, client) in clients {
        engine.recover(mode).await?;
        let head = client.latest_block_number().await?;
        info!("[{}] Recovery complete, watching blocks after {}", mode, head);
        let poll_interval = settings.chains[&mode].poll_interval;
        handles.extend(spawn_chain_listener(
            mode,
            engine.clone(),
            client,
            poll_interval,
            Some(head),
            cancel.clone(),
        ));
    }

    let socket_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        config.server_listen_port,
    );
    handles.push(run_server(
        &socket_address,
        engine,
        metrics,
        prometheus_registry,
        cancel,
    ));
    Ok(handles)
}
