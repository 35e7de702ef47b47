//! Agent Engine
//!
//! Wires the registry, subscriptions, per-token dispatch and the trade
//! lifecycle together and runs the event loop:
//! - chain events are routed to per-token workers
//! - the registry is saved on a timer
//! - unresolved launches are retried in the background
//! - housekeeping prunes idle workers and repairs missing subscriptions

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::dispatch::{TokenDispatcher, TokenJob};
use super::lifecycle::TradeLifecycle;
use super::registry::{AgentRegistry, ReconcileReport};
use super::subscriptions::{SubscriptionError, SubscriptionManager};
use crate::adapters::chain::{QueryError, RemoteQuery};
use crate::adapters::price_oracle::HttpPriceOracle;
use crate::config::Config;
use crate::domain::{LiveBalanceSizing, PositionBook, SizingPolicy, TradeRules};
use crate::ports::{
    ChainDataProvider, ChainEvent, PersistError, PriceOracle, SnapshotStore, TradeExecutor,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to load persisted state: {0}")]
    Load(#[source] PersistError),

    #[error("Chain query failed: {0}")]
    Query(#[from] QueryError),

    #[error("Subscription failed: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Engine is already running")]
    AlreadyRunning,
}

/// Timing knobs for the event loop
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub autosave_interval: Duration,
    pub unresolved_interval: Duration,
    pub unresolved_batch_size: usize,
    pub housekeeping_interval: Duration,
    pub worker_idle: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(600),
            unresolved_interval: Duration::from_secs(300),
            unresolved_batch_size: 25,
            housekeeping_interval: Duration::from_secs(30),
            worker_idle: Duration::from_secs(super::dispatch::DEFAULT_WORKER_IDLE_SECS),
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            autosave_interval: Duration::from_secs(config.persistence.autosave_interval_secs),
            unresolved_interval: Duration::from_secs(config.reconcile.unresolved_interval_secs),
            unresolved_batch_size: config.reconcile.unresolved_batch_size,
            housekeeping_interval: Duration::from_secs(config.engine.housekeeping_interval_secs),
            worker_idle: Duration::from_secs(config.engine.worker_idle_secs),
        }
    }
}

/// Requests a graceful stop of [`AgentEngine::run`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Builder for [`AgentEngine`]
pub struct EngineBuilder {
    query: RemoteQuery,
    executor: Arc<dyn TradeExecutor>,
    store: Arc<dyn SnapshotStore>,
    oracle: Option<Arc<dyn PriceOracle>>,
    sizing: Arc<dyn SizingPolicy>,
    rules: TradeRules,
    max_open_positions: usize,
    settings: EngineSettings,
}

impl EngineBuilder {
    pub fn new(query: RemoteQuery, executor: Arc<dyn TradeExecutor>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            query,
            executor,
            store,
            oracle: None,
            sizing: Arc::new(LiveBalanceSizing::default()),
            rules: TradeRules::default(),
            max_open_positions: crate::domain::position::DEFAULT_MAX_OPEN_POSITIONS,
            settings: EngineSettings::default(),
        }
    }

    /// Configure everything from a loaded [`Config`]
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn ChainDataProvider>,
        executor: Arc<dyn TradeExecutor>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let query = RemoteQuery::new(provider, config.chain.base_token)
            .with_metadata_policy(config.retry.metadata_policy())
            .with_transaction_policy(config.retry.transaction_policy())
            .with_settle(config.retry.settle_policy());

        let mut builder = Self::new(query, executor, store)
            .with_sizing(Arc::from(config.trading.sizing_policy()))
            .with_rules(config.trading.rules())
            .with_max_open_positions(config.trading.max_open_positions)
            .with_settings(EngineSettings::from(config));

        if config.oracle.enabled {
            match config.oracle.get_api_key() {
                Some(key) => match HttpPriceOracle::new(
                    config.oracle.api_url.clone(),
                    key,
                    config.oracle.network.clone(),
                    config.chain.base_token,
                ) {
                    Ok(oracle) => builder = builder.with_oracle(Arc::new(oracle)),
                    Err(e) => warn!("Price oracle disabled: {}", e),
                },
                None => warn!("Price oracle enabled but no API key set (PRICE_API_KEY)"),
            }
        }

        builder
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn PriceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_sizing(mut self, sizing: Arc<dyn SizingPolicy>) -> Self {
        self.sizing = sizing;
        self
    }

    pub fn with_rules(mut self, rules: TradeRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_max_open_positions(mut self, max_open_positions: usize) -> Self {
        self.max_open_positions = max_open_positions;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Load persisted state and assemble the engine.
    ///
    /// Fails if a snapshot exists but cannot be read, so history is never
    /// overwritten with an empty registry.
    pub fn build(self) -> Result<AgentEngine, EngineError> {
        let snapshot = self.store.load().map_err(EngineError::Load)?;
        let saved_positions = self.store.load_positions().map_err(EngineError::Load)?;

        let registry = Arc::new(AgentRegistry::from_snapshot(snapshot));
        let positions = PositionBook::new(self.max_open_positions);
        if !saved_positions.is_empty() {
            info!("Recovered {} open positions", saved_positions.len());
            positions.restore(saved_positions);
        }

        let (subscriptions, events) = SubscriptionManager::new(self.query.provider().clone());
        let subscriptions = Arc::new(subscriptions);

        let mut lifecycle = TradeLifecycle::new(
            registry.clone(),
            self.query.clone(),
            self.executor,
            subscriptions.clone(),
            positions.clone(),
            self.sizing,
            self.rules,
        );
        if let Some(oracle) = self.oracle {
            lifecycle = lifecycle.with_oracle(oracle);
        }

        let (shutdown_tx, _) = watch::channel(false);
        let persister = Persister {
            registry: registry.clone(),
            positions: positions.clone(),
            store: self.store,
            lock: Arc::new(Mutex::new(())),
        };

        Ok(AgentEngine {
            lifecycle: Arc::new(lifecycle),
            registry,
            subscriptions,
            positions,
            query: self.query,
            persister,
            catch_up_end: Arc::new(AtomicU64::new(0)),
            events: Some(events),
            settings: self.settings,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }
}

pub struct AgentEngine {
    lifecycle: Arc<TradeLifecycle>,
    registry: Arc<AgentRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    positions: PositionBook,
    query: RemoteQuery,
    persister: Persister,
    /// Factory pair count seen at bootstrap; catch-up never walks past it
    catch_up_end: Arc<AtomicU64>,
    events: Option<UnboundedReceiver<ChainEvent>>,
    settings: EngineSettings,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl AgentEngine {
    pub fn lifecycle(&self) -> &Arc<TradeLifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Start the feeds, catch up on pairs created while offline, and
    /// resume monitoring recovered positions.
    pub async fn bootstrap(&self) -> Result<ReconcileReport, EngineError> {
        // Feeds first so launches during catch-up queue up instead of being missed
        self.subscriptions.activate_feeds().await?;

        let from = self.registry.reconciled_index().await;
        let total = self.query.pair_count().await?;
        self.catch_up_end.store(total, Ordering::SeqCst);
        info!("Factory has {} pairs, walked up to index {}", total, from);

        let report = self.registry.reconcile_range(&self.query, from, total).await;
        if report.processed > 0 {
            self.persister.save().await;
        }
        if let Some(index) = report.failed_index {
            warn!("Catch-up stopped at pair index {}, retrying on the unresolved timer", index);
        }

        for token in self.positions.tokens() {
            self.lifecycle.ensure_subscription(token).await;
        }

        let counts = self.registry.counts().await;
        info!(
            "Bootstrap complete: {} pairs, {} prototypes, {} sentients, {} unresolved, {} open positions",
            counts.pairs,
            counts.prototypes,
            counts.sentients,
            counts.unresolved,
            self.positions.len()
        );
        Ok(report)
    }

    /// Save the registry and open positions now
    pub async fn persist(&self) {
        self.persister.save().await;
    }

    /// Run the event loop until shutdown is requested or the event stream ends
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let mut events = self.events.take().ok_or(EngineError::AlreadyRunning)?;
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut dispatcher = TokenDispatcher::new(self.lifecycle.clone(), self.settings.worker_idle);

        let mut autosave = ticker(self.settings.autosave_interval);
        let mut redrive = ticker(self.settings.unresolved_interval);
        let mut housekeeping = ticker(self.settings.housekeeping_interval);
        let mut redrive_task: Option<JoinHandle<()>> = None;

        info!("Agent engine running");

        while !*shutdown.borrow() {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.route(&mut dispatcher, event).await,
                    None => {
                        warn!("Event stream closed, stopping");
                        break;
                    }
                },

                _ = autosave.tick() => {
                    self.persister.save().await;
                }

                _ = redrive.tick() => {
                    if redrive_task.as_ref().map_or(true, |task| task.is_finished()) {
                        redrive_task = Some(self.spawn_redrive());
                    } else {
                        debug!("Previous unresolved pass still running, skipping");
                    }
                }

                _ = housekeeping.tick() => {
                    self.housekeeping(&mut dispatcher).await;
                }

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Agent engine stopping");
        if let Some(task) = redrive_task {
            task.abort();
            // Wait out a save already in progress
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Unresolved pass ended abnormally: {}", e);
                }
            }
        }
        dispatcher.shutdown().await;
        self.persister.save().await;
        self.subscriptions.shutdown().await;
        info!("Agent engine stopped");
        Ok(())
    }

    async fn route(&self, dispatcher: &mut TokenDispatcher, event: ChainEvent) {
        match event {
            ChainEvent::Launched { token, pair } => {
                info!("Launch: token {} pair {}", token, pair);
                dispatcher.dispatch(token, TokenJob::Launch { pair });
            }
            ChainEvent::Graduated { old_token, agent_token } => {
                info!("Graduation: {} -> {}", old_token, agent_token);
                dispatcher.dispatch(old_token, TokenJob::Graduated { agent_token });
            }
            ChainEvent::Activity { token } => {
                if self.subscriptions.is_active(&token).await {
                    dispatcher.dispatch(token, TokenJob::PriceSample);
                } else {
                    debug!("Activity for unsubscribed token {} dropped", token);
                }
            }
        }
    }

    async fn housekeeping(&self, dispatcher: &mut TokenDispatcher) {
        let pruned = dispatcher.prune();
        if pruned > 0 {
            debug!("Pruned {} idle workers", pruned);
        }
        for token in self.positions.tokens() {
            if !self.subscriptions.is_active(&token).await {
                dispatcher.dispatch(token, TokenJob::EnsureSubscription);
            }
        }
    }

    /// Resume an interrupted catch-up, then retry unresolved launches
    fn spawn_redrive(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let query = self.query.clone();
        let persister = self.persister.clone();
        let catch_up_end = self.catch_up_end.load(Ordering::SeqCst);
        let batch = self.settings.unresolved_batch_size;

        tokio::spawn(async move {
            let mut changed = false;

            let from = registry.reconciled_index().await;
            if from < catch_up_end {
                let report = registry.reconcile_range(&query, from, catch_up_end).await;
                changed |= report.processed > 0;
            }

            let report = registry.redrive_unresolved(&query, batch).await;
            if report.attempted > 0 {
                info!(
                    "Unresolved pass: {}/{} resolved",
                    report.resolved, report.attempted
                );
            }
            changed |= report.resolved > 0;

            if changed {
                persister.save().await;
            }
        })
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    // Don't burst-fire missed ticks
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Saves registry and positions. Saves from the event loop and the
/// background pass take turns on one lock.
#[derive(Clone)]
struct Persister {
    registry: Arc<AgentRegistry>,
    positions: PositionBook,
    store: Arc<dyn SnapshotStore>,
    lock: Arc<Mutex<()>>,
}

impl Persister {
    /// Log failures; both resources are attempted
    async fn save(&self) {
        let _guard = self.lock.lock().await;
        let snapshot = self.registry.snapshot().await;
        if let Err(e) = self.store.save(&snapshot) {
            error!("Registry save failed: {}", e);
        }
        if let Err(e) = self.store.save_positions(&self.positions.snapshot()) {
            error!("Position save failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::chain::{RetryPolicy, SettlePolicy};
    use crate::ports::mocks::{raw_token, MemoryStore, MockChainProvider, MockExecutor};
    use crate::ports::RegistrySnapshot;
    use alloy_primitives::{Address, U256};

    fn builder(provider: &MockChainProvider, store: MemoryStore) -> EngineBuilder {
        let base = Address::repeat_byte(0xba);
        let fast = RetryPolicy::metadata()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(1));
        let query = RemoteQuery::new(Arc::new(provider.clone()), base)
            .with_metadata_policy(fast.clone())
            .with_transaction_policy(fast)
            .with_settle(SettlePolicy {
                attempts: 2,
                interval: Duration::from_millis(1),
            });
        let executor = MockExecutor::new(base).with_balance(base, U256::from(10u128.pow(19)));
        EngineBuilder::new(query, Arc::new(executor), Arc::new(store))
    }

    #[tokio::test]
    async fn test_bootstrap_catches_up_from_known_count() {
        let base = Address::repeat_byte(0xba);
        let (t1, t2) = (Address::repeat_byte(1), Address::repeat_byte(2));
        let (p1, p2) = (Address::repeat_byte(101), Address::repeat_byte(102));
        let provider = MockChainProvider::new()
            .with_pair(p1, t1, base)
            .with_pair(p2, t2, base);
        provider.set_token(t2, raw_token(t2, p2, 100, false));

        let known = AgentRegistry::new();
        known
            .classify(crate::domain::AgentRecord::try_from(raw_token(t1, p1, 50, false)).unwrap())
            .await;
        known.add_pair(crate::domain::Pair::new(p1, t1)).await;
        let mut snapshot = known.snapshot().await;
        snapshot.reconciled_index = Some(1);
        let store = MemoryStore::new().with_snapshot(snapshot);

        let engine = builder(&provider, store.clone()).build().unwrap();
        let report = engine.bootstrap().await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(provider.token_info_calls(&t1), 0);
        assert_eq!(store.saved().pairs.len(), 2);
        assert_eq!(store.saved().reconciled_index, Some(2));
        assert_eq!(provider.active_subscriptions().len(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_timer_resumes_interrupted_catch_up() {
        let base = Address::repeat_byte(0xba);
        let (t1, t2) = (Address::repeat_byte(1), Address::repeat_byte(2));
        let (p1, p2) = (Address::repeat_byte(101), Address::repeat_byte(102));
        let provider = MockChainProvider::new()
            .with_pair(p1, t1, base)
            .with_pair(p2, t2, base);
        provider.set_token(t1, raw_token(t1, p1, 100, false));
        provider.set_token(t2, raw_token(t2, p2, 100, false));
        provider.fail_pair_index(1);

        let store = MemoryStore::new();
        let settings = EngineSettings {
            unresolved_interval: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let mut engine = builder(&provider, store.clone())
            .with_settings(settings)
            .build()
            .unwrap();
        let report = engine.bootstrap().await.unwrap();
        assert_eq!(report.failed_index, Some(1));
        assert_eq!(store.saved().reconciled_index, Some(1));

        provider.clear_pair_failures();
        let handle = engine.shutdown_handle();
        let task = tokio::spawn(async move { engine.run().await.unwrap() });

        let mut resumed = false;
        for _ in 0..200 {
            if store.saved().reconciled_index == Some(2) {
                resumed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert!(resumed);
        let saved = store.saved();
        assert_eq!(saved.pairs.len(), 2);
        assert!(saved.prototypes.iter().any(|r| r.token == t2));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_saves() {
        let provider = MockChainProvider::new();
        let store = MemoryStore::new().with_snapshot(RegistrySnapshot::default());
        let mut engine = builder(&provider, store.clone()).build().unwrap();
        engine.bootstrap().await.unwrap();

        let handle = engine.shutdown_handle();
        let task = tokio::spawn(async move {
            engine.run().await.unwrap();
            engine
        });
        handle.shutdown();

        let mut engine = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(store.save_count() >= 1);
        assert!(provider.active_subscriptions().is_empty());
        assert!(matches!(engine.run().await, Err(EngineError::AlreadyRunning)));
    }
}
