//! Trade Positions
//!
//! Open positions, their exit levels, and the bounded book that holds them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default take-profit above entry, in percent
pub const DEFAULT_TAKE_PROFIT_PCT: u32 = 20;
/// Default stop-loss below entry, in percent
pub const DEFAULT_STOP_LOSS_PCT: u32 = 40;
/// Default cap on simultaneously open positions
pub const DEFAULT_MAX_OPEN_POSITIONS: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    #[error("Maximum open positions reached ({0})")]
    MaxPositions(usize),

    #[error("Position already open or pending for {0}")]
    AlreadyHolding(Address),
}

/// Why a position was (or should be) closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TargetHit,
    StopLossHit,
    /// Fresh token data could not be fetched
    DataFailure,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TargetHit => write!(f, "target hit"),
            ExitReason::StopLossHit => write!(f, "stop-loss hit"),
            ExitReason::DataFailure => write!(f, "data failure"),
        }
    }
}

/// Percentage rules used to derive exit levels from an entry price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeRules {
    pub take_profit_pct: u32,
    pub stop_loss_pct: u32,
}

impl Default for TradeRules {
    fn default() -> Self {
        Self {
            take_profit_pct: DEFAULT_TAKE_PROFIT_PCT,
            stop_loss_pct: DEFAULT_STOP_LOSS_PCT,
        }
    }
}

/// Target and stop-loss derived from an entry price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevels {
    pub target: U256,
    pub stop_loss: U256,
}

impl PriceLevels {
    pub fn from_entry(price: U256, rules: &TradeRules) -> Self {
        let hundred = U256::from(100u64);
        let up = U256::from(100u64 + rules.take_profit_pct as u64);
        let down = U256::from(100u64.saturating_sub(rules.stop_loss_pct as u64));

        Self {
            target: price.saturating_mul(up) / hundred,
            stop_loss: price.saturating_mul(down) / hundred,
        }
    }

    /// Target is inclusive, stop-loss is strict
    pub fn evaluate(&self, price: U256) -> Option<ExitReason> {
        if price >= self.target {
            Some(ExitReason::TargetHit)
        } else if price < self.stop_loss {
            Some(ExitReason::StopLossHit)
        } else {
            None
        }
    }
}

/// A held token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradePosition {
    pub token: Address,
    pub pair: Address,
    #[serde(with = "crate::domain::agent::u256_decimal")]
    pub entry_price: U256,
    #[serde(with = "crate::domain::agent::u256_decimal")]
    pub target_price: U256,
    #[serde(with = "crate::domain::agent::u256_decimal")]
    pub stop_loss: U256,
    /// Base currency spent on entry
    #[serde(with = "crate::domain::agent::u256_decimal")]
    pub amount_in: U256,
    pub opened_at: DateTime<Utc>,
}

impl TradePosition {
    pub fn open(token: Address, pair: Address, entry_price: U256, levels: PriceLevels, amount_in: U256) -> Self {
        Self {
            token,
            pair,
            entry_price,
            target_price: levels.target,
            stop_loss: levels.stop_loss,
            amount_in,
            opened_at: Utc::now(),
        }
    }

    pub fn levels(&self) -> PriceLevels {
        PriceLevels {
            target: self.target_price,
            stop_loss: self.stop_loss,
        }
    }

    pub fn evaluate(&self, price: U256) -> Option<ExitReason> {
        self.levels().evaluate(price)
    }
}

#[derive(Debug, Default)]
struct BookInner {
    open: HashMap<Address, TradePosition>,
    pending: HashSet<Address>,
}

/// Bounded set of open positions, at most one per token.
///
/// Slots are reserved before the buy is issued, so in-flight buys count
/// against the limit.
#[derive(Debug, Clone)]
pub struct PositionBook {
    inner: Arc<Mutex<BookInner>>,
    max_open: usize,
}

impl PositionBook {
    pub fn new(max_open: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BookInner::default())),
            max_open,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BookInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a slot for `token`, or explain why not
    pub fn try_reserve(&self, token: Address) -> Result<SlotReservation, PositionError> {
        let mut inner = self.lock();
        if inner.open.contains_key(&token) || inner.pending.contains(&token) {
            return Err(PositionError::AlreadyHolding(token));
        }
        if inner.open.len() + inner.pending.len() >= self.max_open {
            return Err(PositionError::MaxPositions(self.max_open));
        }
        inner.pending.insert(token);

        Ok(SlotReservation {
            book: self.clone(),
            token,
            filled: false,
        })
    }

    pub fn get(&self, token: &Address) -> Option<TradePosition> {
        self.lock().open.get(token).cloned()
    }

    pub fn contains(&self, token: &Address) -> bool {
        self.lock().open.contains_key(token)
    }

    pub fn remove(&self, token: &Address) -> Option<TradePosition> {
        self.lock().open.remove(token)
    }

    /// Open positions only
    pub fn len(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tokens(&self) -> Vec<Address> {
        self.lock().open.keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<TradePosition> {
        let mut positions: Vec<_> = self.lock().open.values().cloned().collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    /// Load recovered positions. Entries beyond the limit are still kept;
    /// they only block new reservations until closed.
    pub fn restore(&self, positions: Vec<TradePosition>) {
        let mut inner = self.lock();
        for position in positions {
            inner.open.insert(position.token, position);
        }
    }
}

/// A claimed slot in the [`PositionBook`].
///
/// Dropping it without calling [`SlotReservation::fill`] releases the slot.
#[derive(Debug)]
pub struct SlotReservation {
    book: PositionBook,
    token: Address,
    filled: bool,
}

impl SlotReservation {
    /// Turn the reservation into an open position
    pub fn fill(mut self, position: TradePosition) {
        self.filled = true;
        let mut inner = self.book.lock();
        inner.pending.remove(&self.token);
        inner.open.insert(self.token, position);
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.filled {
            self.book.lock().pending.remove(&self.token);
        }
    }
}
