// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory stand-ins for the chain, the database and the HTTP
//! collaborators, plus a [`TestGateway`] that wires them into an engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address as EthAddress, H256, U256};
use url::Url;
use uuid::Uuid;

use crate::account_pool::AccountPool;
use crate::amount::network_fee;
use crate::config::{ChainSettings, EngineSettings};
use crate::confirmation::ConfirmationConfig;
use crate::crypto::KeyCipher;
use crate::error::{GatewayError, GatewayResult};
use crate::eth_client::ChainClient;
use crate::metrics::GatewayMetrics;
use crate::notifier::{PaymentNotifier, PaymentUpdate};
use crate::payment::{ChainContext, PaymentEngine};
use crate::price::PriceOracle;
use crate::storage::{confirming_states, open_states, AccountRepository, PaymentRepository};
use crate::types::{
    Account, BlockRef, ChainBlock, ChainTransfer, NetworkMode, Payment, PaymentState,
    PaymentStatus, SignedTransfer, TxReceipt,
};

pub const TEST_CHAIN_ID: u64 = 1337;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct ChainState {
    blocks: Vec<ChainBlock>,
    balances: HashMap<EthAddress, U256>,
    receipts: HashMap<H256, TxReceipt>,
    pending_nonces: HashMap<EthAddress, u64>,
    mempool: Vec<SignedTransfer>,
    mined: HashMap<H256, SignedTransfer>,
    sent: Vec<SignedTransfer>,
    gas_price: U256,
    tip_cap: U256,
    auto_mine: bool,
    rpc_failing: bool,
    nonce_too_low_rejections: usize,
    hash_counter: u64,
}

impl ChainState {
    fn fresh_hash(&mut self) -> H256 {
        self.hash_counter += 1;
        H256::from_low_u64_be(0x5eed_0000_0000 + self.hash_counter)
    }

    fn push_block(&mut self, transfers: Vec<ChainTransfer>) -> ChainBlock {
        let block = ChainBlock {
            number: self.blocks.len() as u64,
            hash: self.fresh_hash(),
            transfers,
        };
        self.blocks.push(block.clone());
        block
    }

    fn credit(&mut self, address: EthAddress, value: U256) {
        let balance = self.balances.entry(address).or_default();
        *balance = balance.saturating_add(value);
    }

    fn debit(&mut self, address: EthAddress, value: U256) {
        let balance = self.balances.entry(address).or_default();
        *balance = balance.saturating_sub(value);
    }

    fn mine(&mut self, txs: Vec<SignedTransfer>) -> ChainBlock {
        let transfers = txs
            .iter()
            .map(|tx| ChainTransfer {
                hash: tx.hash,
                to: tx.to,
                value: tx.value,
            })
            .collect();
        let block = self.push_block(transfers);
        for tx in txs {
            self.debit(tx.from, tx.value.saturating_add(network_fee(tx.gas_price)));
            self.credit(tx.to, tx.value);
            self.receipts.insert(
                tx.hash,
                TxReceipt {
                    block_number: block.number,
                    success: true,
                },
            );
            self.mined.insert(tx.hash, tx);
        }
        block
    }
}

/// An in-memory chain. Sent transfers are mined into their own block right
/// away unless auto-mining is switched off.
pub struct MockChainClient {
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl MockChainClient {
    pub fn new(chain_id: u64) -> Self {
        let mut state = ChainState {
            blocks: Vec::new(),
            balances: HashMap::new(),
            receipts: HashMap::new(),
            pending_nonces: HashMap::new(),
            mempool: Vec::new(),
            mined: HashMap::new(),
            sent: Vec::new(),
            gas_price: U256::from(1_000_000_000u64),
            tip_cap: U256::from(1_000_000u64),
            auto_mine: true,
            rpc_failing: false,
            nonce_too_low_rejections: 0,
            hash_counter: 0,
        };
        // genesis
        state.push_block(Vec::new());
        Self {
            chain_id,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    fn rpc(&self) -> GatewayResult<std::sync::MutexGuard<'_, ChainState>> {
        let state = self.state();
        if state.rpc_failing {
            return Err(GatewayError::TransientProviderError(
                "connection refused".to_string(),
            ));
        }
        Ok(state)
    }

    /// Mines a block carrying plain transfers from outside the gateway.
    pub fn mine_block(&self, transfers: Vec<(EthAddress, U256)>) -> ChainBlock {
        let mut state = self.state();
        let transfers = transfers
            .into_iter()
            .map(|(to, value)| {
                state.credit(to, value);
                ChainTransfer {
                    hash: state.fresh_hash(),
                    to,
                    value,
                }
            })
            .collect();
        state.push_block(transfers)
    }

    pub fn mine_empty_blocks(&self, count: u64) -> BlockRef {
        let mut state = self.state();
        let mut last = state.blocks[state.blocks.len() - 1].block_ref();
        for _ in 0..count {
            last = state.push_block(Vec::new()).block_ref();
        }
        last
    }

    /// Mines everything waiting in the mempool into one block.
    pub fn mine_pending(&self) -> ChainBlock {
        let mut state = self.state();
        let txs = std::mem::take(&mut state.mempool);
        state.mine(txs)
    }

    /// Replaces the block at `number` with a sibling of a different hash.
    pub fn reorg_block(&self, number: u64) {
        let mut state = self.state();
        let hash = state.fresh_hash();
        state.blocks[number as usize].hash = hash;
    }

    pub fn insert_receipt(&self, hash: H256, block_number: u64, success: bool) {
        self.state().receipts.insert(
            hash,
            TxReceipt {
                block_number,
                success,
            },
        );
    }

    /// Takes a transfer out of the chain (or the mempool) as if it was never
    /// sent, undoing its balance changes and rewinding the sender's nonce.
    pub fn drop_transaction(&self, hash: H256) {
        let mut state = self.state();
        let tx = if let Some(pos) = state.mempool.iter().position(|tx| tx.hash == hash) {
            state.mempool.remove(pos)
        } else if let Some(tx) = state.mined.remove(&hash) {
            state.receipts.remove(&hash);
            state.credit(tx.from, tx.value.saturating_add(network_fee(tx.gas_price)));
            state.debit(tx.to, tx.value);
            tx
        } else {
            return;
        };
        state.pending_nonces.insert(tx.from, tx.nonce);
    }

    pub fn set_balance(&self, address: EthAddress, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    pub fn balance(&self, address: EthAddress) -> U256 {
        self.state()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_gas_price(&self, gas_price: U256) {
        self.state().gas_price = gas_price;
    }

    pub fn set_pending_nonce(&self, address: EthAddress, nonce: u64) {
        self.state().pending_nonces.insert(address, nonce);
    }

    /// The next `count` submissions fail with "nonce too low".
    pub fn reject_sends_with_nonce_too_low(&self, count: usize) {
        self.state().nonce_too_low_rejections = count;
    }

    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state().auto_mine = auto_mine;
    }

    pub fn set_rpc_failing(&self, failing: bool) {
        self.state().rpc_failing = failing;
    }

    /// Every transfer the node accepted, in submission order.
    pub fn sent_transactions(&self) -> Vec<SignedTransfer> {
        self.state().sent.clone()
    }

    pub fn head(&self) -> ChainBlock {
        let state = self.state();
        state.blocks[state.blocks.len() - 1].clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn chain_id(&self) -> GatewayResult<u64> {
        self.rpc()?;
        Ok(self.chain_id)
    }

    async fn latest_block_number(&self) -> GatewayResult<u64> {
        Ok(self.rpc()?.blocks.len() as u64 - 1)
    }

    async fn block_by_number(&self, number: u64) -> GatewayResult<Option<ChainBlock>> {
        Ok(self.rpc()?.blocks.get(number as usize).cloned())
    }

    async fn block_by_hash(&self, hash: H256) -> GatewayResult<Option<BlockRef>> {
        Ok(self
            .rpc()?
            .blocks
            .iter()
            .find(|b| b.hash == hash)
            .map(|b| b.block_ref()))
    }

    async fn balance_at(&self, address: EthAddress) -> GatewayResult<U256> {
        Ok(self
            .rpc()?
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn transaction_receipt(&self, hash: H256) -> GatewayResult<Option<TxReceipt>> {
        Ok(self.rpc()?.receipts.get(&hash).copied())
    }

    async fn pending_nonce_at(&self, address: EthAddress) -> GatewayResult<u64> {
        Ok(self
            .rpc()?
            .pending_nonces
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn suggest_gas_price(&self) -> GatewayResult<U256> {
        Ok(self.rpc()?.gas_price)
    }

    async fn suggest_gas_tip_cap(&self) -> GatewayResult<U256> {
        Ok(self.rpc()?.tip_cap)
    }

    async fn send_raw_transaction(&self, tx: &SignedTransfer) -> GatewayResult<()> {
        let mut state = self.rpc()?;
        if state.nonce_too_low_rejections > 0 {
            state.nonce_too_low_rejections -= 1;
            return Err(GatewayError::NonceTooLow("nonce too low".to_string()));
        }
        let pending = state
            .pending_nonces
            .get(&tx.from)
            .copied()
            .unwrap_or_default();
        let queued = state
            .mempool
            .iter()
            .position(|q| q.from == tx.from && q.nonce == tx.nonce);
        if tx.nonce < pending && queued.is_none() {
            return Err(GatewayError::NonceTooLow(format!(
                "nonce too low: next nonce {}, tx nonce {}",
                pending, tx.nonce
            )));
        }
        let cost = tx.value.saturating_add(network_fee(tx.gas_price));
        let balance = state.balances.get(&tx.from).copied().unwrap_or_default();
        if balance < cost {
            return Err(GatewayError::ProviderError(format!(
                "insufficient funds for gas * price + value: have {} want {}",
                balance, cost
            )));
        }
        if let Some(pos) = queued {
            state.mempool.remove(pos);
        }
        state.sent.push(tx.clone());
        state.pending_nonces.insert(tx.from, pending.max(tx.nonce + 1));
        if state.auto_mine {
            state.mine(vec![tx.clone()]);
        } else {
            state.mempool.push(tx.clone());
        }
        Ok(())
    }

    async fn wait_for_mined(
        &self,
        hash: H256,
        _timeout: Duration,
    ) -> GatewayResult<Option<TxReceipt>> {
        Ok(self.rpc()?.receipts.get(&hash).copied())
    }
}

struct StoredPayment {
    payment: Payment,
    forward_claimed: bool,
}

#[derive(Default)]
struct StoreState {
    accounts: Vec<Account>,
    payments: HashMap<Uuid, StoredPayment>,
    states: HashMap<Uuid, Vec<PaymentState>>,
}

impl StoreState {
    fn joined(&self, stored: &StoredPayment) -> GatewayResult<Payment> {
        let mut payment = stored.payment.clone();
        payment.account = self
            .accounts
            .iter()
            .find(|a| a.id == payment.account.id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::StorageError(format!("account {} missing", payment.account.id))
            })?;
        Ok(payment)
    }

    fn select(
        &self,
        mode: NetworkMode,
        statuses: &[PaymentStatus],
    ) -> GatewayResult<Vec<Payment>> {
        let mut selected = self
            .payments
            .values()
            .filter(|p| p.payment.mode == mode && statuses.contains(&p.payment.status()))
            .map(|p| self.joined(p))
            .collect::<GatewayResult<Vec<_>>>()?;
        selected.sort_by_key(|p| p.created_at);
        Ok(selected)
    }

    fn write_account(&mut self, account: &Account) -> GatewayResult<()> {
        let stored = self
            .accounts
            .iter_mut()
            .find(|a| a.id == account.id)
            .ok_or_else(|| GatewayError::StorageError(format!("account {} missing", account.id)))?;
        stored.nonce = account.nonce;
        stored.used = account.used;
        stored.remainder = account.remainder;
        Ok(())
    }
}

/// Both repositories over plain maps, with the same conditional writes as
/// the Postgres store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreState>,
    reads_failing: AtomicBool,
}

impl InMemoryStore {
    fn inner(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap()
    }

    /// Makes the per-block payment queries fail like a lost connection.
    pub fn set_reads_failing(&self, failing: bool) {
        self.reads_failing.store(failing, Ordering::SeqCst);
    }

    fn check_reads(&self) -> GatewayResult<()> {
        if self.reads_failing.load(Ordering::SeqCst) {
            return Err(GatewayError::StorageError("connection reset".to_string()));
        }
        Ok(())
    }

    pub fn account_count(&self) -> usize {
        self.inner().accounts.len()
    }

    pub fn account(&self, id: Uuid) -> Option<Account> {
        self.inner().accounts.iter().find(|a| a.id == id).cloned()
    }

    /// Overwrites every column of a stored account.
    pub fn put_account(&self, account: Account) {
        let mut inner = self.inner();
        match inner.accounts.iter_mut().find(|a| a.id == account.id) {
            Some(stored) => *stored = account,
            None => inner.accounts.push(account),
        }
    }

    pub fn states(&self, id: Uuid) -> Vec<PaymentState> {
        self.inner().states.get(&id).cloned().unwrap_or_default()
    }

    /// Moves the creation time back, as if the payment was older.
    pub fn backdate_payment(&self, id: Uuid, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap();
        if let Some(stored) = self.inner().payments.get_mut(&id) {
            stored.payment.created_at -= by;
        }
    }

    pub fn is_forward_claimed(&self, id: Uuid) -> bool {
        self.inner()
            .payments
            .get(&id)
            .map(|p| p.forward_claimed)
            .unwrap_or(false)
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn create_payment(&self, payment: &Payment) -> GatewayResult<()> {
        let mut inner = self.inner();
        if !inner.accounts.iter().any(|a| a.id == payment.account.id) {
            return Err(GatewayError::StorageError(format!(
                "account {} missing",
                payment.account.id
            )));
        }
        inner.states.insert(payment.id, vec![payment.state.clone()]);
        inner.payments.insert(
            payment.id,
            StoredPayment {
                payment: payment.clone(),
                forward_claimed: false,
            },
        );
        Ok(())
    }

    async fn update_payment_state(
        &self,
        payment: &Payment,
        expected_state_id: Uuid,
    ) -> GatewayResult<bool> {
        let mut inner = self.inner();
        let Some(stored) = inner.payments.get_mut(&payment.id) else {
            return Err(GatewayError::StorageError(format!(
                "payment {} missing",
                payment.id
            )));
        };
        if stored.payment.state.id != expected_state_id {
            return Ok(false);
        }
        let created_at = stored.payment.created_at;
        stored.payment = payment.clone();
        stored.payment.created_at = created_at;
        inner
            .states
            .entry(payment.id)
            .or_default()
            .push(payment.state.clone());
        inner.write_account(&payment.account)?;
        Ok(true)
    }

    async fn update_chain_refs(&self, payment: &Payment) -> GatewayResult<()> {
        let mut inner = self.inner();
        let stored = inner
            .payments
            .get_mut(&payment.id)
            .ok_or_else(|| GatewayError::StorageError(format!("payment {} missing", payment.id)))?;
        let p = &mut stored.payment;
        p.last_receiving_block_nr = payment.last_receiving_block_nr;
        p.last_receiving_block_hash = payment.last_receiving_block_hash;
        p.forwarding_tx_hash = payment.forwarding_tx_hash;
        p.forwarding_block_nr = payment.forwarding_block_nr;
        p.forwarding_nonce = payment.forwarding_nonce;
        p.forwarding_amount = payment.forwarding_amount;
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> GatewayResult<Option<Payment>> {
        let inner = self.inner();
        inner
            .payments
            .get(&id)
            .map(|stored| inner.joined(stored))
            .transpose()
    }

    async fn get_payment_states(&self, id: Uuid) -> GatewayResult<Vec<PaymentState>> {
        Ok(self.states(id))
    }

    async fn get_open_payments(&self, mode: NetworkMode) -> GatewayResult<Vec<Payment>> {
        self.check_reads()?;
        self.inner().select(mode, &open_states())
    }

    async fn get_confirming_payments(&self, mode: NetworkMode) -> GatewayResult<Vec<Payment>> {
        self.inner().select(mode, &confirming_states())
    }

    async fn get_finishing_payments(&self, mode: NetworkMode) -> GatewayResult<Vec<Payment>> {
        self.inner().select(mode, &[PaymentStatus::Forwarded])
    }

    async fn try_begin_forward(&self, id: Uuid, expected: PaymentStatus) -> GatewayResult<bool> {
        let mut inner = self.inner();
        match inner.payments.get_mut(&id) {
            Some(stored) if stored.payment.status() == expected && !stored.forward_claimed => {
                stored.forward_claimed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn end_forward(&self, id: Uuid) -> GatewayResult<()> {
        if let Some(stored) = self.inner().payments.get_mut(&id) {
            stored.forward_claimed = false;
        }
        Ok(())
    }

    async fn reset_forward_claims(&self, mode: NetworkMode) -> GatewayResult<u64> {
        let mut released = 0;
        for stored in self.inner().payments.values_mut() {
            if stored.payment.mode == mode && stored.forward_claimed {
                stored.forward_claimed = false;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl AccountRepository for InMemoryStore {
    async fn allocate_free_account(&self, mode: NetworkMode) -> GatewayResult<Option<Account>> {
        let mut inner = self.inner();
        Ok(inner
            .accounts
            .iter_mut()
            .find(|a| !a.used && a.mode == mode)
            .map(|a| {
                a.used = true;
                a.clone()
            }))
    }

    async fn create_account(&self, account: &Account) -> GatewayResult<()> {
        self.inner().accounts.push(account.clone());
        Ok(())
    }

    async fn update_account(&self, account: &Account) -> GatewayResult<()> {
        self.inner().write_account(account)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    updates: Mutex<Vec<PaymentUpdate>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn updates(&self) -> Vec<PaymentUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentNotifier for RecordingNotifier {
    async fn notify(&self, update: &PaymentUpdate) -> GatewayResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::NotificationError(
                "merchant backend unavailable".to_string(),
            ));
        }
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

/// Quotes every fiat unit at a fixed ETH rate.
pub struct FixedPriceOracle {
    eth_per_unit: f64,
}

impl FixedPriceOracle {
    pub fn new(eth_per_unit: f64) -> Self {
        Self { eth_per_unit }
    }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn to_native(&self, amount: f64, _currency: &str) -> GatewayResult<f64> {
        Ok(amount * self.eth_per_unit)
    }
}

pub fn test_settings() -> EngineSettings {
    let mut chains = BTreeMap::new();
    chains.insert(
        NetworkMode::Test,
        ChainSettings {
            rpc_url: Url::parse("http://localhost:8545").unwrap(),
            expected_chain_id: Some(TEST_CHAIN_ID),
            gas_price_override: None,
            confirmations: ConfirmationConfig::mainnet(),
            poll_interval: Duration::from_millis(10),
            mined_timeout: Duration::from_secs(1),
        },
    );
    EngineSettings {
        earnings_percent: 1,
        fee_factor: 100,
        treasury_wallet: TestGateway::treasury(),
        payment_timeout: Duration::from_secs(15 * 60),
        chains,
    }
}

/// An engine on the `test` network over a mock chain and in-memory store.
/// Gas costs 1 gwei and one fiat unit is quoted at 0.0001 ETH.
pub struct TestGateway {
    pub engine: Arc<PaymentEngine>,
    pub client: Arc<MockChainClient>,
    pub store: Arc<InMemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub metrics: Arc<GatewayMetrics>,
}

impl TestGateway {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(customize: impl FnOnce(&mut EngineSettings)) -> Self {
        init_test_logging();
        let mut settings = test_settings();
        customize(&mut settings);

        let client = Arc::new(MockChainClient::new(TEST_CHAIN_ID));
        let store = Arc::new(InMemoryStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let metrics = Arc::new(GatewayMetrics::new_for_testing());
        let cipher = Arc::new(KeyCipher::new("test-gateway-secret").unwrap());

        let contexts = settings
            .chains
            .iter()
            .map(|(mode, chain)| {
                ChainContext::new(
                    *mode,
                    TEST_CHAIN_ID,
                    client.clone(),
                    chain,
                    &settings,
                    store.clone(),
                    cipher.clone(),
                    metrics.clone(),
                )
            })
            .collect();
        let pool = AccountPool::new(store.clone(), cipher, metrics.clone());
        let engine = Arc::new(PaymentEngine::new(
            settings,
            contexts,
            store.clone(),
            store.clone(),
            pool,
            Arc::new(FixedPriceOracle::new(0.0001)),
            notifier.clone(),
            metrics.clone(),
        ));
        Self {
            engine,
            client,
            store,
            notifier,
            metrics,
        }
    }

    pub fn merchant() -> EthAddress {
        EthAddress::repeat_byte(0x77)
    }

    pub fn treasury() -> EthAddress {
        EthAddress::repeat_byte(0xee)
    }

    pub async fn create_payment(&self, price_amount: f64) -> Payment {
        self.engine
            .create_payment(NetworkMode::Test, price_amount, "EUR", Self::merchant())
            .await
            .unwrap()
    }

    /// Runs the engine over `block` and waits for every task it spawned.
    pub async fn process(&self, block: &ChainBlock) {
        let handles = self
            .engine
            .on_new_block(NetworkMode::Test, block)
            .await
            .unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    /// Mines and processes a block paying `value` to `address`.
    pub async fn deposit(&self, address: EthAddress, value: U256) -> ChainBlock {
        let block = self.client.mine_block(vec![(address, value)]);
        self.process(&block).await;
        block
    }

    /// Mines and processes `blocks` empty blocks.
    pub async fn advance(&self, blocks: u64) {
        for _ in 0..blocks {
            let block = self.client.mine_block(Vec::new());
            self.process(&block).await;
        }
    }

    pub async fn payment(&self, id: Uuid) -> Payment {
        self.store.get_payment(id).await.unwrap().unwrap()
    }

    pub async fn statuses(&self, id: Uuid) -> Vec<PaymentStatus> {
        self.store
            .get_payment_states(id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.status)
            .collect()
    }
}
