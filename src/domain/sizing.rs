//! Position Sizing
//!
//! Decides how much base currency to commit to a new position.

use std::sync::OnceLock;

use alloy_primitives::U256;
use thiserror::Error;

/// Basis points in one whole
pub const BPS_DENOMINATOR: u64 = 10_000;
/// Default fraction of the balance committed per position (25%)
pub const DEFAULT_FRACTION_BPS: u32 = 2_500;
/// Default minimum base balance required to trade (0.5 with 18 decimals)
pub const DEFAULT_MIN_BALANCE: u128 = 500_000_000_000_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SizingError {
    #[error("Base balance {balance} below minimum {minimum}")]
    InsufficientBalance { balance: U256, minimum: U256 },

    #[error("Computed trade amount is zero")]
    ZeroAmount,
}

/// Strategy for sizing a new position from the current base balance
pub trait SizingPolicy: Send + Sync {
    fn size(&self, balance: U256) -> Result<U256, SizingError>;

    fn name(&self) -> &'static str;
}

fn fraction_of(amount: U256, fraction_bps: u32) -> U256 {
    amount.saturating_mul(U256::from(fraction_bps)) / U256::from(BPS_DENOMINATOR)
}

fn check_minimum(balance: U256, minimum: U256) -> Result<(), SizingError> {
    if balance < minimum {
        return Err(SizingError::InsufficientBalance { balance, minimum });
    }
    Ok(())
}

/// Commit a fixed fraction of whatever the balance is right now
#[derive(Debug, Clone)]
pub struct LiveBalanceSizing {
    pub fraction_bps: u32,
    pub min_balance: U256,
}

impl Default for LiveBalanceSizing {
    fn default() -> Self {
        Self {
            fraction_bps: DEFAULT_FRACTION_BPS,
            min_balance: U256::from(DEFAULT_MIN_BALANCE),
        }
    }
}

impl SizingPolicy for LiveBalanceSizing {
    fn size(&self, balance: U256) -> Result<U256, SizingError> {
        check_minimum(balance, self.min_balance)?;
        let amount = fraction_of(balance, self.fraction_bps);
        if amount.is_zero() {
            return Err(SizingError::ZeroAmount);
        }
        Ok(amount)
    }

    fn name(&self) -> &'static str {
        "live_balance"
    }
}

/// Commit a fixed fraction of the first balance observed this session,
/// capped by what is actually available
#[derive(Debug)]
pub struct FixedPoolSizing {
    pub fraction_bps: u32,
    pub min_balance: U256,
    pool: OnceLock<U256>,
}

impl FixedPoolSizing {
    pub fn new(fraction_bps: u32, min_balance: U256) -> Self {
        Self {
            fraction_bps,
            min_balance,
            pool: OnceLock::new(),
        }
    }

    pub fn pool(&self) -> Option<U256> {
        self.pool.get().copied()
    }
}

impl SizingPolicy for FixedPoolSizing {
    fn size(&self, balance: U256) -> Result<U256, SizingError> {
        check_minimum(balance, self.min_balance)?;
        let pool = *self.pool.get_or_init(|| balance);
        let amount = fraction_of(pool, self.fraction_bps).min(balance);
        if amount.is_zero() {
            return Err(SizingError::ZeroAmount);
        }
        Ok(amount)
    }

    fn name(&self) -> &'static str {
        "fixed_pool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ether(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000_000_000_000u128)
    }

    #[test]
    fn test_live_balance_takes_quarter() {
        let sizing = LiveBalanceSizing::default();
        assert_eq!(sizing.size(ether(8)).unwrap(), ether(2));
        assert_eq!(sizing.size(ether(4)).unwrap(), ether(1));
    }

    #[test]
    fn test_live_balance_enforces_minimum() {
        let sizing = LiveBalanceSizing::default();
        let below = U256::from(DEFAULT_MIN_BALANCE - 1);

        assert!(matches!(
            sizing.size(below),
            Err(SizingError::InsufficientBalance { .. })
        ));
        assert!(sizing.size(U256::from(DEFAULT_MIN_BALANCE)).is_ok());
    }

    #[test]
    fn test_fixed_pool_uses_first_balance() {
        let sizing = FixedPoolSizing::new(2_500, U256::ZERO);

        assert_eq!(sizing.size(ether(8)).unwrap(), ether(2));
        assert_eq!(sizing.pool(), Some(ether(8)));
        // Balance shrank, amount stays pinned to the pool
        assert_eq!(sizing.size(ether(6)).unwrap(), ether(2));
        // Capped by what is left
        assert_eq!(sizing.size(ether(1)).unwrap(), ether(1));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let sizing = LiveBalanceSizing {
            fraction_bps: 1,
            min_balance: U256::ZERO,
        };
        assert_eq!(sizing.size(U256::from(10u64)), Err(SizingError::ZeroAmount));
    }
}
