//! Trade Lifecycle State Machine
//!
//! Drives a token from discovery through classification, entry, monitoring
//! and exit. Every entry point is called from the token's own worker, so
//! calls for one token never overlap.

use std::sync::Arc;

use alloy_primitives::Address;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::dispatch::{TokenJob, TokenJobHandler};
use super::registry::AgentRegistry;
use super::subscriptions::SubscriptionManager;
use crate::adapters::chain::RemoteQuery;
use crate::domain::{
    to_decimal_units, AgentRecord, Classification, ExitReason, Pair, PositionBook, PositionError,
    PriceLevels, SizingError, SizingPolicy, TradePosition, TradeRules, UnresolvedLaunch,
};
use crate::ports::{ExecutionError, PriceOracle, TradeExecutor};

/// Decimals of the base token and of agent market caps
const BASE_DECIMALS: u8 = 18;

/// Why a classified prototype was not bought
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRejection {
    Book(PositionError),
    Balance(ExecutionError),
    Sizing(SizingError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Token was already classified; duplicate launch ignored
    AlreadyKnown,
    /// Data unavailable, parked for later reconciliation
    Unresolved,
    /// Externally traded, never bought
    Sentient,
    Rejected(EntryRejection),
    BuyFailed,
    Holding,
    /// Sold right after entry
    Closed(ExitReason),
    /// Exit triggered right after entry but the sell failed
    CloseFailed(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// No position in this token
    Ignored,
    Holding,
    Closed(ExitReason),
    CloseFailed(ExitReason),
}

pub struct TradeLifecycle {
    registry: Arc<AgentRegistry>,
    query: RemoteQuery,
    executor: Arc<dyn TradeExecutor>,
    subscriptions: Arc<SubscriptionManager>,
    positions: PositionBook,
    sizing: Arc<dyn SizingPolicy>,
    rules: TradeRules,
    oracle: Option<Arc<dyn PriceOracle>>,
}

impl TradeLifecycle {
    pub fn new(
        registry: Arc<AgentRegistry>,
        query: RemoteQuery,
        executor: Arc<dyn TradeExecutor>,
        subscriptions: Arc<SubscriptionManager>,
        positions: PositionBook,
        sizing: Arc<dyn SizingPolicy>,
        rules: TradeRules,
    ) -> Self {
        Self {
            registry,
            query,
            executor,
            subscriptions,
            positions,
            sizing,
            rules,
            oracle: None,
        }
    }

    /// Log market caps in quote currency using this oracle
    pub fn with_oracle(mut self, oracle: Arc<dyn PriceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Handle a launch event for `token` on `pair`
    pub async fn on_launch(&self, pair: Address, token: Address) -> LaunchOutcome {
        self.registry.add_pair(Pair::new(pair, token)).await;

        if self.registry.contains_token(&token).await || self.positions.contains(&token) {
            debug!("Duplicate launch for {}, ignoring", token);
            return LaunchOutcome::AlreadyKnown;
        }

        let record = match self.query.fetch_token_info(token).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Launch {} unresolved: {}", token, e);
                self.registry.park_unresolved(UnresolvedLaunch { pair, token }).await;
                return LaunchOutcome::Unresolved;
            }
        };

        if self.registry.classify(record.clone()).await == Classification::Sentient {
            info!("{} trades on the external market, not buying", record.display_name());
            return LaunchOutcome::Sentient;
        }

        info!("New prototype: {} ({})", record.display_name(), token);
        self.log_valuation(&record).await;

        let levels = PriceLevels::from_entry(record.metrics.price, &self.rules);
        self.open_position(&record, levels).await
    }

    async fn log_valuation(&self, record: &AgentRecord) {
        let Some(oracle) = &self.oracle else {
            return;
        };
        let Some(cap) = to_decimal_units(record.metrics.market_cap, BASE_DECIMALS) else {
            return;
        };
        match oracle.base_price().await {
            Ok(price) => info!(
                "{} market cap: {} base (${:.2})",
                record.display_name(),
                cap.round_dp(2),
                cap * price
            ),
            Err(e) => warn!("Base price unavailable: {}", e),
        }
    }

    async fn open_position(&self, record: &AgentRecord, levels: PriceLevels) -> LaunchOutcome {
        let token = record.token;

        let reservation = match self.positions.try_reserve(token) {
            Ok(reservation) => reservation,
            Err(e) => {
                info!("Not buying {}: {}", token, e);
                return LaunchOutcome::Rejected(EntryRejection::Book(e));
            }
        };

        let balance = match self.executor.balance(self.query.base_token()).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("Base balance unavailable, not buying {}: {}", token, e);
                return LaunchOutcome::Rejected(EntryRejection::Balance(e));
            }
        };

        let amount = match self.sizing.size(balance) {
            Ok(amount) => amount,
            Err(e) => {
                warn!("Not buying {}: {}", token, e);
                return LaunchOutcome::Rejected(EntryRejection::Sizing(e));
            }
        };

        if let Err(e) = self.executor.buy(token, amount).await {
            error!("Buy of {} failed: {}", token, e);
            return LaunchOutcome::BuyFailed;
        }

        reservation.fill(TradePosition::open(
            token,
            record.pair,
            record.metrics.price,
            levels,
            amount,
        ));
        info!(
            "Bought {} with {} base units @ {} (target {}, stop {})",
            token, amount, record.metrics.price, levels.target, levels.stop_loss
        );

        // Price may already be past target by the time the buy lands
        let exit = match self.query.fetch_token_info(token).await {
            Ok(fresh) => {
                let price = fresh.metrics.price;
                self.registry.classify(fresh).await;
                (price >= levels.target).then_some(ExitReason::TargetHit)
            }
            Err(e) => {
                warn!("Post-buy check for {} failed: {}", token, e);
                Some(ExitReason::DataFailure)
            }
        };

        match exit {
            Some(reason) => {
                if self.close_position(token, reason).await {
                    LaunchOutcome::Closed(reason)
                } else {
                    LaunchOutcome::CloseFailed(reason)
                }
            }
            None => {
                self.ensure_subscription(token).await;
                LaunchOutcome::Holding
            }
        }
    }

    /// Handle activity on a held token
    pub async fn on_price_sample(&self, token: Address) -> SampleOutcome {
        let Some(position) = self.positions.get(&token) else {
            debug!("Sample for {} without a position, ignoring", token);
            return SampleOutcome::Ignored;
        };

        let reason = match self.query.fetch_token_info(token).await {
            Ok(record) => {
                let price = record.metrics.price;
                self.registry.classify(record).await;
                match position.evaluate(price) {
                    Some(reason) => {
                        info!("{} for {} at {} (entry {})", reason, token, price, position.entry_price);
                        reason
                    }
                    None => return SampleOutcome::Holding,
                }
            }
            Err(e) => {
                warn!("Price sample for {} failed, forcing close: {}", token, e);
                ExitReason::DataFailure
            }
        };

        if self.close_position(token, reason).await {
            SampleOutcome::Closed(reason)
        } else {
            SampleOutcome::CloseFailed(reason)
        }
    }

    /// Sell the whole token balance and drop the position.
    ///
    /// Returns false if the position is still open; its subscription is
    /// kept so the next sample retries.
    pub async fn close_position(&self, token: Address, reason: ExitReason) -> bool {
        if !self.positions.contains(&token) {
            self.subscriptions.teardown(&token).await;
            return true;
        }

        let balance = match self.executor.balance(token).await {
            Ok(balance) => balance,
            Err(e) => {
                error!("Balance of {} unavailable, cannot sell ({}): {}", token, reason, e);
                self.ensure_subscription(token).await;
                return false;
            }
        };

        if balance.is_zero() {
            warn!("Nothing held in {}, treating position as closed", token);
        } else if let Err(e) = self.executor.sell(token, balance).await {
            error!("Sell of {} failed ({}): {}", token, reason, e);
            self.ensure_subscription(token).await;
            return false;
        }

        self.positions.remove(&token);
        self.subscriptions.teardown(&token).await;
        info!("Closed {} ({}), sold {}", token, reason, balance);
        true
    }

    /// Handle a graduation event for `old_token`
    pub async fn on_graduated(&self, old_token: Address, agent_token: Address) {
        match self.registry.graduate(old_token, agent_token).await {
            Some(record) => info!("{} graduated to {}", record.display_name(), agent_token),
            None => debug!("Graduation for unknown token {}", old_token),
        }
        if self.positions.contains(&old_token) {
            warn!("Graduated token {} still held, monitoring continues", old_token);
        }
    }

    /// Re-install the activity subscription for a held token if missing
    pub async fn ensure_subscription(&self, token: Address) {
        let Some(position) = self.positions.get(&token) else {
            return;
        };
        if self.subscriptions.is_active(&token).await {
            return;
        }
        if let Err(e) = self.subscriptions.install(token, position.pair).await {
            warn!("Activity subscription for {} failed, will retry: {}", token, e);
        }
    }
}

#[async_trait]
impl TokenJobHandler for TradeLifecycle {
    async fn handle(&self, token: Address, job: TokenJob) {
        match job {
            TokenJob::Launch { pair } => {
                let outcome = self.on_launch(pair, token).await;
                debug!("Launch {} -> {:?}", token, outcome);
            }
            TokenJob::PriceSample => {
                let outcome = self.on_price_sample(token).await;
                debug!("Sample {} -> {:?}", token, outcome);
            }
            TokenJob::Graduated { agent_token } => self.on_graduated(token, agent_token).await,
            TokenJob::EnsureSubscription => self.ensure_subscription(token).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::chain::{RetryPolicy, SettlePolicy};
    use crate::domain::LiveBalanceSizing;
    use crate::ports::mocks::{raw_token, MockChainProvider, MockExecutor, MockOracle};
    use alloy_primitives::U256;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn base() -> Address {
        Address::repeat_byte(0xba)
    }

    struct Harness {
        provider: MockChainProvider,
        executor: MockExecutor,
        lifecycle: TradeLifecycle,
    }

    fn harness() -> Harness {
        let provider = MockChainProvider::new();
        let executor = MockExecutor::new(base())
            .with_balance(base(), U256::from(4_000_000_000_000_000_000u128));
        let fast = RetryPolicy::metadata()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(1));
        let query = RemoteQuery::new(Arc::new(provider.clone()), base())
            .with_metadata_policy(fast.clone())
            .with_transaction_policy(fast)
            .with_settle(SettlePolicy {
                attempts: 2,
                interval: Duration::from_millis(1),
            });
        let (subscriptions, _events) = SubscriptionManager::new(Arc::new(provider.clone()));

        let lifecycle = TradeLifecycle::new(
            Arc::new(AgentRegistry::new()),
            query,
            Arc::new(executor.clone()),
            Arc::new(subscriptions),
            PositionBook::new(4),
            Arc::new(LiveBalanceSizing::default()),
            TradeRules::default(),
        )
        .with_oracle(Arc::new(MockOracle::new(dec!(1.5))));

        Harness {
            provider,
            executor,
            lifecycle,
        }
    }

    fn ids(n: u8) -> (Address, Address) {
        (Address::repeat_byte(n), Address::repeat_byte(n + 100))
    }

    #[tokio::test]
    async fn test_launch_buys_prototype_and_subscribes() {
        let h = harness();
        let (token, pair) = ids(1);
        h.provider.set_token(token, raw_token(token, pair, 100, false));

        let outcome = h.lifecycle.on_launch(pair, token).await;

        assert_eq!(outcome, LaunchOutcome::Holding);
        assert_eq!(h.executor.buys(), vec![(token, U256::from(1_000_000_000_000_000_000u128))]);
        let position = h.lifecycle.positions().get(&token).unwrap();
        assert_eq!(position.target_price, U256::from(120u64));
        assert_eq!(position.stop_loss, U256::from(60u64));
        assert_eq!(h.provider.activity_subscription_count(&token), 1);
    }

    #[tokio::test]
    async fn test_sentient_is_never_bought() {
        let h = harness();
        let (token, pair) = ids(1);
        h.provider.set_token(token, raw_token(token, pair, 100, true));

        assert_eq!(h.lifecycle.on_launch(pair, token).await, LaunchOutcome::Sentient);
        assert!(h.executor.buys().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_launch_is_parked() {
        let h = harness();
        let (token, pair) = ids(1);

        assert_eq!(h.lifecycle.on_launch(pair, token).await, LaunchOutcome::Unresolved);
        let unresolved = h.lifecycle.registry().unresolved(10).await;
        assert_eq!(unresolved, vec![UnresolvedLaunch { pair, token }]);
        assert!(h.executor.buys().is_empty());
    }

    #[tokio::test]
    async fn test_failed_buy_releases_slot() {
        let h = harness();
        let (token, pair) = ids(1);
        h.provider.set_token(token, raw_token(token, pair, 100, false));
        h.executor.set_fail_buy(true);

        assert_eq!(h.lifecycle.on_launch(pair, token).await, LaunchOutcome::BuyFailed);
        assert!(h.lifecycle.positions().is_empty());
        assert!(h.lifecycle.positions().try_reserve(token).is_ok());
        assert_eq!(h.provider.activity_subscription_count(&token), 0);
    }

    #[tokio::test]
    async fn test_target_already_hit_after_buy_sells_immediately() {
        let h = harness();
        let (token, pair) = ids(1);
        h.provider.push_token_response(token, Ok(raw_token(token, pair, 100, false)));
        h.provider.set_token(token, raw_token(token, pair, 130, false));

        let outcome = h.lifecycle.on_launch(pair, token).await;

        assert_eq!(outcome, LaunchOutcome::Closed(ExitReason::TargetHit));
        assert_eq!(h.executor.sells().len(), 1);
        assert!(h.lifecycle.positions().is_empty());
        assert_eq!(h.provider.activity_subscription_count(&token), 0);
    }

    #[tokio::test]
    async fn test_failed_sell_keeps_position_and_subscription() {
        let h = harness();
        let (token, pair) = ids(1);
        h.provider.set_token(token, raw_token(token, pair, 100, false));
        h.lifecycle.on_launch(pair, token).await;

        h.executor.set_fail_sell(true);
        h.provider.set_token(token, raw_token(token, pair, 150, false));
        assert_eq!(
            h.lifecycle.on_price_sample(token).await,
            SampleOutcome::CloseFailed(ExitReason::TargetHit)
        );
        assert!(h.lifecycle.positions().contains(&token));
        assert!(h.lifecycle.subscriptions().is_active(&token).await);

        h.executor.set_fail_sell(false);
        assert_eq!(
            h.lifecycle.on_price_sample(token).await,
            SampleOutcome::Closed(ExitReason::TargetHit)
        );
        assert!(!h.lifecycle.subscriptions().is_active(&token).await);
    }

    #[tokio::test]
    async fn test_zero_balance_counts_as_closed() {
        let h = harness();
        let (token, pair) = ids(1);
        h.provider.set_token(token, raw_token(token, pair, 100, false));
        h.lifecycle.on_launch(pair, token).await;

        // Tokens left the wallet some other way
        h.executor.sell(token, h.executor.balance_of(&token)).await.unwrap();

        assert!(h.lifecycle.close_position(token, ExitReason::StopLossHit).await);
        assert!(h.lifecycle.positions().is_empty());
        assert_eq!(h.executor.sells().len(), 1);
    }

    #[tokio::test]
    async fn test_sample_without_position_is_ignored() {
        let h = harness();
        let (token, _) = ids(1);
        assert_eq!(h.lifecycle.on_price_sample(token).await, SampleOutcome::Ignored);
        assert_eq!(h.provider.token_info_calls(&token), 0);
    }

    #[tokio::test]
    async fn test_graduation_moves_record() {
        let h = harness();
        let (token, pair) = ids(1);
        h.provider.set_token(token, raw_token(token, pair, 100, false));
        h.lifecycle.on_launch(pair, token).await;

        h.lifecycle.on_graduated(token, Address::repeat_byte(0xee)).await;

        assert_eq!(
            h.lifecycle.registry().classification_of(&token).await,
            Some(Classification::Sentient)
        );
        // Still monitored until it closes
        assert!(h.lifecycle.positions().contains(&token));
    }

    #[tokio::test]
    async fn test_ensure_subscription_reinstalls() {
        let h = harness();
        let (token, pair) = ids(1);
        h.provider.set_token(token, raw_token(token, pair, 100, false));
        h.provider.set_fail_subscribe(true);
        assert_eq!(h.lifecycle.on_launch(pair, token).await, LaunchOutcome::Holding);
        assert!(!h.lifecycle.subscriptions().is_active(&token).await);

        h.provider.set_fail_subscribe(false);
        h.lifecycle.handle(token, TokenJob::EnsureSubscription).await;

        assert!(h.lifecycle.subscriptions().is_active(&token).await);
    }
}
