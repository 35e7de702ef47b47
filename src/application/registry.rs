//! Agent Registry
//!
//! In-memory catalog of known pairs, prototypes, sentients and launches
//! still waiting for data. All access goes through narrow async methods;
//! the lock never leaves this module.

use std::collections::BTreeMap;

use alloy_primitives::Address;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapters::chain::RemoteQuery;
use crate::domain::{AgentRecord, Classification, Pair, UnresolvedLaunch};
use crate::ports::RegistrySnapshot;

#[derive(Debug, Default)]
struct RegistryState {
    pairs: BTreeMap<Address, Pair>,
    prototypes: BTreeMap<Address, AgentRecord>,
    sentients: BTreeMap<Address, AgentRecord>,
    /// Keyed by pair address
    unresolved: BTreeMap<Address, UnresolvedLaunch>,
    /// Factory indices below this have all been walked
    reconciled: u64,
}

impl RegistryState {
    fn clear_unresolved(&mut self, token: &Address) {
        self.unresolved.retain(|_, launch| launch.token != *token);
    }

    fn is_classified(&self, token: &Address) -> bool {
        self.prototypes.contains_key(token) || self.sentients.contains_key(token)
    }
}

/// Outcome of walking a range of factory pair indices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub processed: u64,
    pub prototypes: u64,
    pub sentients: u64,
    pub unresolved: u64,
    /// Index at which the walk stopped because the pair could not be resolved
    pub failed_index: Option<u64>,
}

/// Outcome of a pass over unresolved launches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedriveReport {
    pub attempted: usize,
    pub resolved: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub pairs: usize,
    pub prototypes: usize,
    pub sentients: usize,
    pub unresolved: usize,
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted snapshot.
    ///
    /// Pairs whose token has no record become unresolved launches again.
    /// A snapshot without a reconcile cursor resumes after its known pairs.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let mut state = RegistryState {
            reconciled: snapshot
                .reconciled_index
                .unwrap_or(snapshot.pairs.len() as u64),
            ..RegistryState::default()
        };

        for record in snapshot.sentients {
            state.sentients.insert(record.token, record);
        }
        for record in snapshot.prototypes {
            if !state.sentients.contains_key(&record.token) {
                state.prototypes.insert(record.token, record);
            }
        }
        for pair in snapshot.pairs {
            if !state.is_classified(&pair.token) {
                state.unresolved.insert(
                    pair.address,
                    UnresolvedLaunch {
                        pair: pair.address,
                        token: pair.token,
                    },
                );
            }
            state.pairs.insert(pair.address, pair);
        }

        Self {
            state: RwLock::new(state),
        }
    }

    /// Record a pair, returns true if it was new
    pub async fn add_pair(&self, pair: Pair) -> bool {
        self.state.write().await.pairs.insert(pair.address, pair).is_none()
    }

    pub async fn add_prototype(&self, record: AgentRecord) {
        let mut state = self.state.write().await;
        state.sentients.remove(&record.token);
        state.clear_unresolved(&record.token);
        state.prototypes.insert(record.token, record);
    }

    pub async fn add_sentient(&self, record: AgentRecord) {
        let mut state = self.state.write().await;
        state.prototypes.remove(&record.token);
        state.clear_unresolved(&record.token);
        state.sentients.insert(record.token, record);
    }

    /// Store a record in the collection its flag selects.
    ///
    /// Graduation is one-way: a fresh read of a known sentient that still
    /// reports bonding-curve trading keeps it a sentient.
    pub async fn classify(&self, mut record: AgentRecord) -> Classification {
        let mut state = self.state.write().await;

        if !record.trading_on_external_market {
            if let Some(known) = state.sentients.get(&record.token) {
                record.trading_on_external_market = true;
                record.agent_token = record.agent_token.or(known.agent_token);
            }
        }

        let class = record.classification();
        state.clear_unresolved(&record.token);
        match class {
            Classification::Prototype => {
                state.sentients.remove(&record.token);
                state.prototypes.insert(record.token, record);
            }
            Classification::Sentient => {
                state.prototypes.remove(&record.token);
                state.sentients.insert(record.token, record);
            }
        }
        class
    }

    /// Move a prototype to the sentients after it migrated
    pub async fn graduate(&self, old_token: Address, agent_token: Address) -> Option<AgentRecord> {
        let mut state = self.state.write().await;

        let mut record = match state.prototypes.remove(&old_token) {
            Some(record) => record,
            None => {
                let existing = state.sentients.get_mut(&old_token)?;
                existing.graduate(agent_token);
                return Some(existing.clone());
            }
        };

        record.graduate(agent_token);
        state.sentients.insert(old_token, record.clone());
        Some(record)
    }

    /// Keep a launch whose data could not be fetched yet
    pub async fn park_unresolved(&self, launch: UnresolvedLaunch) -> bool {
        let mut state = self.state.write().await;
        if state.is_classified(&launch.token) {
            return false;
        }
        state.unresolved.insert(launch.pair, launch).is_none()
    }

    pub async fn unresolved(&self, limit: usize) -> Vec<UnresolvedLaunch> {
        self.state.read().await.unresolved.values().take(limit).copied().collect()
    }

    pub async fn classification_of(&self, token: &Address) -> Option<Classification> {
        let state = self.state.read().await;
        if state.sentients.contains_key(token) {
            Some(Classification::Sentient)
        } else if state.prototypes.contains_key(token) {
            Some(Classification::Prototype)
        } else {
            None
        }
    }

    pub async fn contains_token(&self, token: &Address) -> bool {
        self.state.read().await.is_classified(token)
    }

    pub async fn get(&self, token: &Address) -> Option<AgentRecord> {
        let state = self.state.read().await;
        state
            .prototypes
            .get(token)
            .or_else(|| state.sentients.get(token))
            .cloned()
    }

    pub async fn pair_count(&self) -> u64 {
        self.state.read().await.pairs.len() as u64
    }

    /// First factory index catch-up has not walked yet.
    ///
    /// Pairs learned from launch events do not move it, so a pair that
    /// failed during catch-up is retried even after newer pairs arrive.
    pub async fn reconciled_index(&self) -> u64 {
        self.state.read().await.reconciled
    }

    pub async fn counts(&self) -> RegistryCounts {
        let state = self.state.read().await;
        RegistryCounts {
            pairs: state.pairs.len(),
            prototypes: state.prototypes.len(),
            sentients: state.sentients.len(),
            unresolved: state.unresolved.len(),
        }
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read().await;
        RegistrySnapshot {
            pairs: state.pairs.values().copied().collect(),
            prototypes: state.prototypes.values().cloned().collect(),
            sentients: state.sentients.values().cloned().collect(),
            reconciled_index: Some(state.reconciled),
        }
    }

    /// Walk factory pair indices `[from, to)` in order and classify each token.
    ///
    /// A token whose data cannot be fetched is kept as an unresolved launch.
    /// The walk stops at the first index whose pair cannot be resolved, so a
    /// later pass starting from [`AgentRegistry::reconciled_index`] resumes there.
    pub async fn reconcile_range(&self, query: &RemoteQuery, from: u64, to: u64) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if from >= to {
            return report;
        }
        info!("Reconciling pairs {}..{}", from, to);

        for index in from..to {
            let pair = match query.pair_at(index).await {
                Ok(address) => match query.resolve_pair_token(address).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Pair {} at index {} unresolvable: {}", address, index, e);
                        report.failed_index = Some(index);
                        break;
                    }
                },
                Err(e) => {
                    warn!("Failed to read pair index {}: {}", index, e);
                    report.failed_index = Some(index);
                    break;
                }
            };

            {
                let mut state = self.state.write().await;
                state.pairs.insert(pair.address, pair);
                if state.reconciled == index {
                    state.reconciled = index + 1;
                }
            }
            report.processed += 1;

            if self.contains_token(&pair.token).await {
                debug!("Token {} already classified, skipping", pair.token);
                continue;
            }

            match query.fetch_token_snapshot(pair.token).await {
                Ok(record) => match self.classify(record).await {
                    Classification::Prototype => report.prototypes += 1,
                    Classification::Sentient => report.sentients += 1,
                },
                Err(e) => {
                    warn!("Token info for {} unavailable, parking: {}", pair.token, e);
                    self.park_unresolved(UnresolvedLaunch {
                        pair: pair.address,
                        token: pair.token,
                    })
                    .await;
                    report.unresolved += 1;
                }
            }
        }

        info!(
            "Reconciled {} pairs: {} prototypes, {} sentients, {} unresolved",
            report.processed, report.prototypes, report.sentients, report.unresolved
        );
        report
    }

    /// Retry up to `limit` unresolved launches. Classifies only.
    pub async fn redrive_unresolved(&self, query: &RemoteQuery, limit: usize) -> RedriveReport {
        let pending = self.unresolved(limit).await;
        let mut report = RedriveReport {
            attempted: pending.len(),
            resolved: 0,
        };

        for launch in pending {
            match query.fetch_token_snapshot(launch.token).await {
                Ok(record) => {
                    let class = self.classify(record).await;
                    info!("Unresolved launch {} resolved as {}", launch.token, class);
                    report.resolved += 1;
                }
                Err(e) => debug!("Launch {} still unresolved: {}", launch.token, e),
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::chain::{RetryPolicy, SettlePolicy};
    use crate::ports::mocks::{raw_token, MockChainProvider};
    use std::sync::Arc;
    use std::time::Duration;

    fn record(n: u8, external: bool) -> AgentRecord {
        AgentRecord::try_from(raw_token(
            Address::repeat_byte(n),
            Address::repeat_byte(n + 100),
            100,
            external,
        ))
        .unwrap()
    }

    fn query(provider: MockChainProvider, base: Address) -> RemoteQuery {
        let fast = RetryPolicy::metadata()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(1));
        RemoteQuery::new(Arc::new(provider), base)
            .with_metadata_policy(fast.clone())
            .with_transaction_policy(fast)
            .with_settle(SettlePolicy {
                attempts: 2,
                interval: Duration::from_millis(1),
            })
    }

    #[tokio::test]
    async fn test_add_is_mutually_exclusive() {
        let registry = AgentRegistry::new();
        let token = Address::repeat_byte(1);

        registry.add_prototype(record(1, false)).await;
        assert_eq!(registry.classification_of(&token).await, Some(Classification::Prototype));

        registry.add_sentient(record(1, true)).await;
        let counts = registry.counts().await;
        assert_eq!(counts.prototypes, 0);
        assert_eq!(counts.sentients, 1);
    }

    #[tokio::test]
    async fn test_classify_is_idempotent() {
        let registry = AgentRegistry::new();
        registry.classify(record(1, false)).await;
        registry.classify(record(1, false)).await;

        let counts = registry.counts().await;
        assert_eq!(counts.prototypes, 1);
        assert_eq!(counts.sentients, 0);
    }

    #[tokio::test]
    async fn test_graduation_is_one_way() {
        let registry = AgentRegistry::new();
        let token = Address::repeat_byte(1);
        let external = Address::repeat_byte(0xee);
        registry.classify(record(1, false)).await;

        let graduated = registry.graduate(token, external).await.unwrap();
        assert_eq!(graduated.agent_token, Some(external));

        // Stale read still says bonding curve
        let class = registry.classify(record(1, false)).await;
        assert_eq!(class, Classification::Sentient);
        assert_eq!(registry.get(&token).await.unwrap().agent_token, Some(external));
        assert_eq!(registry.counts().await.prototypes, 0);
    }

    #[tokio::test]
    async fn test_graduate_unknown_token() {
        let registry = AgentRegistry::new();
        assert!(registry.graduate(Address::repeat_byte(9), Address::repeat_byte(8)).await.is_none());
    }

    #[tokio::test]
    async fn test_park_skips_classified_tokens() {
        let registry = AgentRegistry::new();
        registry.classify(record(1, false)).await;

        let parked = registry
            .park_unresolved(UnresolvedLaunch {
                pair: Address::repeat_byte(101),
                token: Address::repeat_byte(1),
            })
            .await;
        assert!(!parked);
        assert!(registry.unresolved(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_from_snapshot_rebuilds_unresolved() {
        let snapshot = RegistrySnapshot {
            pairs: vec![
                Pair::new(Address::repeat_byte(101), Address::repeat_byte(1)),
                Pair::new(Address::repeat_byte(102), Address::repeat_byte(2)),
            ],
            prototypes: vec![record(1, false)],
            sentients: vec![],
            reconciled_index: Some(2),
        };

        let registry = AgentRegistry::from_snapshot(snapshot.clone());

        let unresolved = registry.unresolved(10).await;
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].token, Address::repeat_byte(2));
        assert_eq!(registry.snapshot().await, snapshot);
    }

    #[tokio::test]
    async fn test_reconcile_range_classifies_and_parks() {
        let base = Address::repeat_byte(0xba);
        let (t1, t2, t3) = (Address::repeat_byte(1), Address::repeat_byte(2), Address::repeat_byte(3));
        let (p1, p2, p3) = (Address::repeat_byte(101), Address::repeat_byte(102), Address::repeat_byte(103));
        let provider = MockChainProvider::new()
            .with_pair(p1, t1, base)
            .with_pair(p2, base, t2)
            .with_pair(p3, t3, base);
        provider.set_token(t1, raw_token(t1, p1, 100, false));
        provider.set_token(t2, raw_token(t2, p2, 0, true));
        // t3 has no data

        let registry = AgentRegistry::new();
        let report = registry.reconcile_range(&query(provider, base), 0, 3).await;

        assert_eq!(report.processed, 3);
        assert_eq!(report.prototypes, 1);
        assert_eq!(report.sentients, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.failed_index, None);
        assert_eq!(registry.pair_count().await, 3);
        assert_eq!(registry.unresolved(10).await[0].token, t3);
    }

    #[tokio::test]
    async fn test_reconcile_stops_at_failed_index() {
        let base = Address::repeat_byte(0xba);
        let provider = MockChainProvider::new()
            .with_pair(Address::repeat_byte(101), Address::repeat_byte(1), base)
            .with_pair(Address::repeat_byte(102), Address::repeat_byte(2), base);
        provider.set_token(Address::repeat_byte(1), raw_token(Address::repeat_byte(1), Address::repeat_byte(101), 5, false));
        provider.fail_pair_index(1);

        let registry = AgentRegistry::new();
        let report = registry.reconcile_range(&query(provider, base), 0, 2).await;

        assert_eq!(report.processed, 1);
        assert_eq!(report.failed_index, Some(1));
        assert_eq!(registry.pair_count().await, 1);
        assert_eq!(registry.reconciled_index().await, 1);
    }

    #[tokio::test]
    async fn test_failed_index_survives_newer_launch_pairs() {
        let base = Address::repeat_byte(0xba);
        let (t1, t2, t3) = (Address::repeat_byte(1), Address::repeat_byte(2), Address::repeat_byte(3));
        let (p1, p2, p3) = (Address::repeat_byte(101), Address::repeat_byte(102), Address::repeat_byte(103));
        let provider = MockChainProvider::new()
            .with_pair(p1, t1, base)
            .with_pair(p2, t2, base)
            .with_pair(p3, t3, base);
        for (t, p) in [(t1, p1), (t2, p2), (t3, p3)] {
            provider.set_token(t, raw_token(t, p, 5, false));
        }
        provider.fail_pair_index(1);

        let registry = AgentRegistry::new();
        let q = query(provider.clone(), base);
        registry.reconcile_range(&q, 0, 2).await;

        // A launch event delivers the pair at index 2 before catch-up resumes
        registry.add_pair(Pair::new(p3, t3)).await;
        registry.classify(AgentRecord::try_from(raw_token(t3, p3, 5, false)).unwrap()).await;
        assert_eq!(registry.pair_count().await, 2);

        // Cursor survives a save and reload
        let registry = AgentRegistry::from_snapshot(registry.snapshot().await);
        let from = registry.reconciled_index().await;
        assert_eq!(from, 1);

        provider.clear_pair_failures();
        let report = registry.reconcile_range(&q, from, 3).await;

        assert_eq!(report.failed_index, None);
        assert_eq!(registry.classification_of(&t2).await, Some(Classification::Prototype));
        assert_eq!(registry.pair_count().await, 3);
        assert_eq!(registry.reconciled_index().await, 3);
        assert_eq!(provider.token_info_calls(&t3), 0);
    }

    #[tokio::test]
    async fn test_redrive_resolves_late_launches() {
        let token = Address::repeat_byte(1);
        let pair = Address::repeat_byte(101);
        let provider = MockChainProvider::new();
        let registry = AgentRegistry::new();
        registry.add_pair(Pair::new(pair, token)).await;
        registry.park_unresolved(UnresolvedLaunch { pair, token }).await;

        let q = query(provider.clone(), Address::ZERO);
        assert_eq!(registry.redrive_unresolved(&q, 10).await.resolved, 0);

        provider.set_token(token, raw_token(token, pair, 100, false));
        let report = registry.redrive_unresolved(&q, 10).await;

        assert_eq!(report, RedriveReport { attempted: 1, resolved: 1 });
        assert!(registry.unresolved(10).await.is_empty());
        assert_eq!(registry.classification_of(&token).await, Some(Classification::Prototype));
    }
}
