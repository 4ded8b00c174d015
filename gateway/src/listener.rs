// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-mode block feed into the payment engine.
//!
//! A [`HeadWatcher`] polls the node for its head and emits every new block
//! in height order over a channel; a [`ChainListener`] drains the channel
//! and hands each block to [`PaymentEngine::on_new_block`]. A block the
//! engine could not take, for instance while the database is unreachable,
//! is kept and handed over again ahead of the next one. Blocks produced
//! while the node was down are covered by [`PaymentEngine::recover`], not
//! by replay.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::eth_client::ChainClient;
use crate::payment::PaymentEngine;
use crate::types::{ChainBlock, NetworkMode};

/// Blocks fetched per tick at most; a watcher further behind skips ahead.
pub const DEFAULT_MAX_CATCH_UP: u64 = 64;

const BLOCK_CHANNEL_SIZE: usize = 128;

pub struct HeadWatcher {
    mode: NetworkMode,
    client: Arc<dyn ChainClient>,
    poll_interval: Duration,
    max_catch_up: u64,
}

impl HeadWatcher {
    pub fn new(mode: NetworkMode, client: Arc<dyn ChainClient>, poll_interval: Duration) -> Self {
        Self {
            mode,
            client,
            poll_interval,
            max_catch_up: DEFAULT_MAX_CATCH_UP,
        }
    }

    pub fn with_max_catch_up(mut self, blocks: u64) -> Self {
        self.max_catch_up = blocks.max(1);
        self
    }

    /// Starts polling. Blocks above `start_after` are emitted; with `None`
    /// the watcher starts at the current head.
    pub fn run(
        self,
        start_after: Option<u64>,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, mpsc::Receiver<ChainBlock>) {
        let (block_tx, block_rx) = mpsc::channel(BLOCK_CHANNEL_SIZE);
        let handle = tokio::spawn(run_head_watcher_task(self, start_after, block_tx, cancel));
        (handle, block_rx)
    }
}

async fn run_head_watcher_task(
    watcher: HeadWatcher,
    mut last_block: Option<u64>,
    block_tx: mpsc::Sender<ChainBlock>,
    cancel: CancellationToken,
) {
    let mode = watcher.mode;
    info!("[{}] Starting head watcher task", mode);
    let mut interval = time::interval(watcher.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[{}] Head watcher task cancelled", mode);
                break;
            }
            _ = interval.tick() => {
                let latest = match watcher.client.latest_block_number().await {
                    Ok(latest) => latest,
                    Err(e) => {
                        warn!("[{}] Failed to get latest block: {}", mode, e);
                        continue;
                    }
                };
                let mut from = last_block.map_or(latest, |n| n + 1);
                if latest >= from && latest - from >= watcher.max_catch_up {
                    let skip_to = latest + 1 - watcher.max_catch_up;
                    warn!(
                        "[{}] {} blocks behind, skipping from {} to {}",
                        mode,
                        latest - from + 1,
                        from,
                        skip_to
                    );
                    from = skip_to;
                }
                for number in from..=latest {
                    match watcher.client.block_by_number(number).await {
                        Ok(Some(block)) => {
                            if block_tx.send(block).await.is_err() {
                                info!("[{}] Block receiver dropped, stopping head watcher", mode);
                                return;
                            }
                            last_block = Some(number);
                        }
                        Ok(None) => {
                            debug!("[{}] Block {} not available yet", mode, number);
                            break;
                        }
                        Err(e) => {
                            warn!("[{}] Failed to fetch block {}: {}", mode, number, e);
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Feeds blocks of one mode into the engine.
pub struct ChainListener {
    mode: NetworkMode,
    engine: Arc<PaymentEngine>,
}

impl ChainListener {
    pub fn new(mode: NetworkMode, engine: Arc<PaymentEngine>) -> Self {
        Self { mode, engine }
    }

    pub async fn run(self, mut blocks: mpsc::Receiver<ChainBlock>, cancel: CancellationToken) {
        info!("[{}] Starting chain listener", self.mode);
        let mut backlog: VecDeque<ChainBlock> = VecDeque::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] Chain listener cancelled", self.mode);
                    break;
                }
                block = blocks.recv() => {
                    let Some(block) = block else {
                        info!("[{}] Block feed closed, stopping chain listener", self.mode);
                        break;
                    };
                    self.queue_block(&mut backlog, block);
                    while let Some(next) = backlog.front() {
                        if !self.handle_block(next).await {
                            break;
                        }
                        backlog.pop_front();
                    }
                }
            }
        }
    }

    fn queue_block(&self, backlog: &mut VecDeque<ChainBlock>, block: ChainBlock) {
        if backlog.len() as u64 >= DEFAULT_MAX_CATCH_UP {
            if let Some(dropped) = backlog.pop_front() {
                warn!(
                    "[{}] Backlog full, giving up on block {}",
                    self.mode, dropped.number
                );
            }
        }
        backlog.push_back(block);
    }

    /// Returns `false` if the block should be handed over again later.
    async fn handle_block(&self, block: &ChainBlock) -> bool {
        // Evaluations run detached so that a stuck payment never holds up the next block.
        match self.engine.on_new_block(self.mode, block).await {
            Ok(handles) => {
                debug!(
                    "[{}] Block {} dispatched {} payment evaluations",
                    self.mode,
                    block.number,
                    handles.len()
                );
                true
            }
            Err(e @ GatewayError::ConfigError(_)) => {
                error!(
                    "[{}] Failed to process block {}: {}",
                    self.mode, block.number, e
                );
                true
            }
            Err(e) => {
                warn!(
                    "[{}] Block {} kept for the next tick: {}",
                    self.mode, block.number, e
                );
                false
            }
        }
    }
}

/// Spawns the watcher and listener pair for `mode`.
pub fn spawn_chain_listener(
    mode: NetworkMode,
    engine: Arc<PaymentEngine>,
    client: Arc<dyn ChainClient>,
    poll_interval: Duration,
    start_after: Option<u64>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let (watcher_handle, blocks) =
        HeadWatcher::new(mode, client, poll_interval).run(start_after, cancel.clone());
    let listener = ChainListener::new(mode, engine);
    vec![
        watcher_handle,
        tokio::spawn(listener.run(blocks, cancel)),
    ]
}
