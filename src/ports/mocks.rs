//! Hand-written test doubles for the ports.
//!
//! Each mock records its calls and serves scripted responses so tests can
//! drive the engine without a chain, an executor, or a disk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc::UnboundedSender;

use super::chain::{ChainDataProvider, ChainEvent, EventFilter, ProviderError, SubscriptionId};
use super::execution::{ExecutionError, TradeExecutor};
use super::oracle::{OracleError, PriceOracle};
use super::persistence::{PersistError, RegistrySnapshot, SnapshotStore};
use crate::domain::{RawTokenInfo, TradePosition};

/// Build a minimal raw token record with the given price
pub fn raw_token(token: Address, pair: Address, price: u64, external: bool) -> RawTokenInfo {
    RawTokenInfo {
        creator: Address::repeat_byte(0xcc).to_string(),
        token: token.to_string(),
        pair: pair.to_string(),
        name: format!("Agent {}", &token.to_string()[..6]),
        ticker: "AGT".to_string(),
        supply: "1000000000000000000000000000".to_string(),
        price: price.to_string(),
        market_cap: (price as u128 * 1_000_000_000).to_string(),
        trading: true,
        trading_on_external_market: external,
        ..Default::default()
    }
}

#[derive(Debug, Default)]
struct ChainState {
    pairs: Vec<(Address, Address, Address)>,
    queued: HashMap<Address, VecDeque<Result<RawTokenInfo, ProviderError>>>,
    fallback: HashMap<Address, Result<RawTokenInfo, ProviderError>>,
    info_calls: HashMap<Address, usize>,
    subscriptions: HashMap<SubscriptionId, (EventFilter, UnboundedSender<ChainEvent>)>,
    unsubscribed: Vec<SubscriptionId>,
    fail_pair_indices: HashSet<u64>,
    fail_subscribe: bool,
}

/// Mock chain provider with scripted token responses and a live event bus
#[derive(Debug, Default, Clone)]
pub struct MockChainProvider {
    state: Arc<Mutex<ChainState>>,
    next_id: Arc<AtomicU64>,
}

impl MockChainProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pair at the next factory index
    pub fn with_pair(self, pair: Address, token_a: Address, token_b: Address) -> Self {
        self.state.lock().unwrap().pairs.push((pair, token_a, token_b));
        self
    }

    /// Response served once the token's queue is exhausted
    pub fn set_token(&self, token: Address, info: RawTokenInfo) {
        self.state.lock().unwrap().fallback.insert(token, Ok(info));
    }

    pub fn set_token_error(&self, token: Address, error: ProviderError) {
        self.state.lock().unwrap().fallback.insert(token, Err(error));
    }

    /// Queue a one-shot response, served before the fallback
    pub fn push_token_response(&self, token: Address, response: Result<RawTokenInfo, ProviderError>) {
        self.state
            .lock()
            .unwrap()
            .queued
            .entry(token)
            .or_default()
            .push_back(response);
    }

    pub fn fail_pair_index(&self, index: u64) {
        self.state.lock().unwrap().fail_pair_indices.insert(index);
    }

    pub fn clear_pair_failures(&self) {
        self.state.lock().unwrap().fail_pair_indices.clear();
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state.lock().unwrap().fail_subscribe = fail;
    }

    pub fn token_info_calls(&self, token: &Address) -> usize {
        self.state.lock().unwrap().info_calls.get(token).copied().unwrap_or(0)
    }

    pub fn active_subscriptions(&self) -> Vec<EventFilter> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .map(|(filter, _)| *filter)
            .collect()
    }

    pub fn activity_subscription_count(&self, token: &Address) -> usize {
        self.active_subscriptions()
            .into_iter()
            .filter(|f| matches!(f, EventFilter::TokenActivity { token: t, .. } if t == token))
            .count()
    }

    pub fn unsubscribed(&self) -> Vec<SubscriptionId> {
        self.state.lock().unwrap().unsubscribed.clone()
    }

    /// Deliver an event to every matching subscription, returns the number of sinks reached
    pub fn emit(&self, event: ChainEvent) -> usize {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .values()
            .filter(|(filter, _)| match (filter, &event) {
                (EventFilter::Launches, ChainEvent::Launched { .. }) => true,
                (EventFilter::Graduations, ChainEvent::Graduated { .. }) => true,
                (EventFilter::TokenActivity { token, .. }, ChainEvent::Activity { token: t }) => token == t,
                _ => false,
            })
            .filter(|(_, sink)| sink.send(event).is_ok())
            .count()
    }
}

#[async_trait]
impl ChainDataProvider for MockChainProvider {
    async fn all_pairs_length(&self) -> Result<u64, ProviderError> {
        Ok(self.state.lock().unwrap().pairs.len() as u64)
    }

    async fn pair_at(&self, index: u64) -> Result<Address, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.fail_pair_indices.contains(&index) {
            return Err(ProviderError::Closed);
        }
        state
            .pairs
            .get(index as usize)
            .map(|(pair, _, _)| *pair)
            .ok_or_else(|| ProviderError::Rpc {
                code: -32000,
                message: format!("no pair at index {}", index),
            })
    }

    async fn pair_tokens(&self, pair: Address) -> Result<(Address, Address), ProviderError> {
        self.state
            .lock()
            .unwrap()
            .pairs
            .iter()
            .find(|(p, _, _)| *p == pair)
            .map(|(_, a, b)| (*a, *b))
            .ok_or(ProviderError::Closed)
    }

    async fn token_info(&self, token: Address) -> Result<RawTokenInfo, ProviderError> {
        let mut state = self.state.lock().unwrap();
        *state.info_calls.entry(token).or_insert(0) += 1;

        if let Some(response) = state.queued.get_mut(&token).and_then(|q| q.pop_front()) {
            return response;
        }
        state.fallback.get(&token).cloned().unwrap_or_else(|| {
            Err(ProviderError::Rpc {
                code: -32000,
                message: "execution reverted".to_string(),
            })
        })
    }

    async fn subscribe(
        &self,
        filter: EventFilter,
        sink: UnboundedSender<ChainEvent>,
    ) -> Result<SubscriptionId, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_subscribe {
            return Err(ProviderError::Transport("subscription refused".to_string()));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        state.subscriptions.insert(id, (filter, sink));
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.remove(&id);
        state.unsubscribed.push(id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ExecutorState {
    balances: HashMap<Address, U256>,
    buys: Vec<(Address, U256)>,
    sells: Vec<(Address, U256)>,
    fail_buy: bool,
    fail_sell: bool,
}

/// Mock executor that keeps notional balances.
///
/// Buys debit the base balance and credit the token one-for-one; sells
/// zero the token balance.
#[derive(Debug, Default, Clone)]
pub struct MockExecutor {
    state: Arc<Mutex<ExecutorState>>,
    base_token: Address,
}

impl MockExecutor {
    pub fn new(base_token: Address) -> Self {
        Self {
            state: Arc::default(),
            base_token,
        }
    }

    pub fn with_balance(self, token: Address, amount: U256) -> Self {
        self.state.lock().unwrap().balances.insert(token, amount);
        self
    }

    pub fn set_fail_buy(&self, fail: bool) {
        self.state.lock().unwrap().fail_buy = fail;
    }

    pub fn set_fail_sell(&self, fail: bool) {
        self.state.lock().unwrap().fail_sell = fail;
    }

    pub fn buys(&self) -> Vec<(Address, U256)> {
        self.state.lock().unwrap().buys.clone()
    }

    pub fn sells(&self) -> Vec<(Address, U256)> {
        self.state.lock().unwrap().sells.clone()
    }

    pub fn balance_of(&self, token: &Address) -> U256 {
        self.state.lock().unwrap().balances.get(token).copied().unwrap_or_default()
    }
}

#[async_trait]
impl TradeExecutor for MockExecutor {
    async fn buy(&self, token: Address, amount: U256) -> Result<(), ExecutionError> {
        let mut state = self.state.lock().unwrap();
        state.buys.push((token, amount));
        if state.fail_buy {
            return Err(ExecutionError::Reverted("buy failed".to_string()));
        }
        let base = state.balances.entry(self.base_token).or_default();
        *base = base.saturating_sub(amount);
        *state.balances.entry(token).or_default() += amount;
        Ok(())
    }

    async fn sell(&self, token: Address, amount: U256) -> Result<(), ExecutionError> {
        let mut state = self.state.lock().unwrap();
        state.sells.push((token, amount));
        if state.fail_sell {
            return Err(ExecutionError::Rejected("sell failed".to_string()));
        }
        let held = state.balances.entry(token).or_default();
        *held = held.saturating_sub(amount);
        *state.balances.entry(self.base_token).or_default() += amount;
        Ok(())
    }

    async fn balance(&self, token: Address) -> Result<U256, ExecutionError> {
        Ok(self.balance_of(&token))
    }
}

/// Fixed-price oracle
#[derive(Debug, Clone)]
pub struct MockOracle {
    price: Option<Decimal>,
}

impl MockOracle {
    pub fn new(price: Decimal) -> Self {
        Self { price: Some(price) }
    }

    pub fn failing() -> Self {
        Self { price: None }
    }
}

#[async_trait]
impl PriceOracle for MockOracle {
    async fn base_price(&self) -> Result<Decimal, OracleError> {
        self.price
            .ok_or_else(|| OracleError::Request("oracle offline".to_string()))
    }
}

/// In-memory snapshot store
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    snapshot: Arc<Mutex<RegistrySnapshot>>,
    positions: Arc<Mutex<Vec<TradePosition>>>,
    saves: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(self, snapshot: RegistrySnapshot) -> Self {
        *self.snapshot.lock().unwrap() = snapshot;
        self
    }

    pub fn with_positions(self, positions: Vec<TradePosition>) -> Self {
        *self.positions.lock().unwrap() = positions;
        self
    }

    pub fn saved(&self) -> RegistrySnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn saved_positions(&self) -> Vec<TradePosition> {
        self.positions.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<RegistrySnapshot, PersistError> {
        Ok(self.saved())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), PersistError> {
        *self.snapshot.lock().unwrap() = snapshot.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_positions(&self) -> Result<Vec<TradePosition>, PersistError> {
        Ok(self.saved_positions())
    }

    fn save_positions(&self, positions: &[TradePosition]) -> Result<(), PersistError> {
        *self.positions.lock().unwrap() = positions.to_vec();
        Ok(())
    }
}
