//! Event Subscription Manager
//!
//! Owns every live subscription on the chain provider: the launch and
//! graduation feeds, and one activity subscription per held token.
//! All events flow into a single channel consumed by the engine.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Address;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ports::{ChainDataProvider, ChainEvent, EventFilter, ProviderError, SubscriptionId};

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Failed to subscribe to {filter:?}: {source}")]
    Subscribe {
        filter: EventFilter,
        #[source]
        source: ProviderError,
    },
}

pub struct SubscriptionManager {
    provider: Arc<dyn ChainDataProvider>,
    sink: UnboundedSender<ChainEvent>,
    active: Mutex<HashMap<Address, SubscriptionId>>,
    feeds: Mutex<Vec<SubscriptionId>>,
}

impl SubscriptionManager {
    /// Create the manager and the receiving end of its event channel
    pub fn new(provider: Arc<dyn ChainDataProvider>) -> (Self, UnboundedReceiver<ChainEvent>) {
        let (sink, events) = mpsc::unbounded_channel();
        let manager = Self {
            provider,
            sink,
            active: Mutex::new(HashMap::new()),
            feeds: Mutex::new(Vec::new()),
        };
        (manager, events)
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<SubscriptionId, SubscriptionError> {
        self.provider
            .subscribe(filter, self.sink.clone())
            .await
            .map_err(|source| SubscriptionError::Subscribe { filter, source })
    }

    /// Start the launch and graduation feeds. Safe to call once per run.
    pub async fn activate_feeds(&self) -> Result<(), SubscriptionError> {
        let mut feeds = self.feeds.lock().await;
        if !feeds.is_empty() {
            return Ok(());
        }
        for filter in [EventFilter::Launches, EventFilter::Graduations] {
            let id = self.subscribe(filter).await?;
            info!("Subscribed to {:?} feed ({:?})", filter, id);
            feeds.push(id);
        }
        Ok(())
    }

    /// Activate price samples for `token`. Returns the existing handle if already active.
    pub async fn install(&self, token: Address, pair: Address) -> Result<SubscriptionId, SubscriptionError> {
        let mut active = self.active.lock().await;
        if let Some(id) = active.get(&token) {
            return Ok(*id);
        }

        let id = self.subscribe(EventFilter::TokenActivity { token, pair }).await?;
        active.insert(token, id);
        debug!("Activity subscription {:?} installed for {}", id, token);
        Ok(id)
    }

    /// Deactivate price samples for `token`. Returns false if nothing was active.
    ///
    /// The handle leaves the map before the provider is told, so concurrent
    /// callers cannot unsubscribe the same handle twice.
    pub async fn teardown(&self, token: &Address) -> bool {
        let id = match self.active.lock().await.remove(token) {
            Some(id) => id,
            None => return false,
        };

        if let Err(e) = self.provider.unsubscribe(id).await {
            warn!("Unsubscribe {:?} for {} failed: {}", id, token, e);
        } else {
            debug!("Activity subscription {:?} removed for {}", id, token);
        }
        true
    }

    pub async fn is_active(&self, token: &Address) -> bool {
        self.active.lock().await.contains_key(token)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Drop every subscription, feeds included
    pub async fn shutdown(&self) {
        let mut ids: Vec<SubscriptionId> = self.active.lock().await.drain().map(|(_, id)| id).collect();
        ids.extend(self.feeds.lock().await.drain(..));

        for id in &ids {
            if let Err(e) = self.provider.unsubscribe(*id).await {
                warn!("Unsubscribe {:?} failed during shutdown: {}", id, e);
            }
        }
        info!("Subscriptions shut down ({} removed)", ids.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::mocks::MockChainProvider;

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let provider = MockChainProvider::new();
        let (manager, _events) = SubscriptionManager::new(Arc::new(provider.clone()));
        let token = Address::repeat_byte(1);

        let first = manager.install(token, Address::repeat_byte(2)).await.unwrap();
        let second = manager.install(token, Address::repeat_byte(2)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.activity_subscription_count(&token), 1);
        assert!(manager.is_active(&token).await);
    }

    #[tokio::test]
    async fn test_teardown_unsubscribes_once() {
        let provider = MockChainProvider::new();
        let (manager, _events) = SubscriptionManager::new(Arc::new(provider.clone()));
        let token = Address::repeat_byte(1);
        let id = manager.install(token, Address::repeat_byte(2)).await.unwrap();

        assert!(manager.teardown(&token).await);
        assert!(!manager.teardown(&token).await);

        assert_eq!(provider.unsubscribed(), vec![id]);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_events_reach_channel() {
        let provider = MockChainProvider::new();
        let (manager, mut events) = SubscriptionManager::new(Arc::new(provider.clone()));
        manager.activate_feeds().await.unwrap();
        manager.activate_feeds().await.unwrap();
        assert_eq!(provider.active_subscriptions().len(), 2);

        let launch = ChainEvent::Launched {
            token: Address::repeat_byte(1),
            pair: Address::repeat_byte(2),
        };
        assert_eq!(provider.emit(launch), 1);
        assert_eq!(events.recv().await, Some(launch));
    }

    #[tokio::test]
    async fn test_failed_install_leaves_inactive() {
        let provider = MockChainProvider::new();
        provider.set_fail_subscribe(true);
        let (manager, _events) = SubscriptionManager::new(Arc::new(provider.clone()));
        let token = Address::repeat_byte(1);

        assert!(manager.install(token, Address::repeat_byte(2)).await.is_err());
        assert!(!manager.is_active(&token).await);
    }

    #[tokio::test]
    async fn test_shutdown_removes_everything() {
        let provider = MockChainProvider::new();
        let (manager, _events) = SubscriptionManager::new(Arc::new(provider.clone()));
        manager.activate_feeds().await.unwrap();
        manager.install(Address::repeat_byte(1), Address::repeat_byte(2)).await.unwrap();

        manager.shutdown().await;

        assert!(provider.active_subscriptions().is_empty());
        assert_eq!(provider.unsubscribed().len(), 3);

        // Feed handles were drained, so a restart subscribes afresh
        manager.activate_feeds().await.unwrap();
        assert_eq!(provider.active_subscriptions().len(), 2);
    }
}
