//! Integer minor-unit money arithmetic and the platform commission tiers.
//!
//! Every money-computing path in the engine goes through this module; a
//! single source of truth for the commission keeps release, adjudication
//! override and reporting from drifting apart.

use serde::{Deserialize, Serialize};

/// Commission rate in basis points (5%).
pub const COMMISSION_RATE_BPS: i64 = 500;

/// Flat fee tiers by gross amount (minor units).
pub const SMALL_ORDER_CEILING: i64 = 2_500;
pub const LARGE_ORDER_FLOOR: i64 = 5_000;
pub const SMALL_ORDER_FLAT_FEE: i64 = 100;
pub const LARGE_ORDER_FLAT_FEE: i64 = 200;

/// Result of a commission calculation for one sub-order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionBreakdown {
    pub gross: i64,
    pub rate_fee: i64,
    pub flat_fee: i64,
    pub commission: i64,
    pub settle_amount: i64,
}

/// Compute the platform commission for a gross sub-order amount.
///
/// The percentage component is 5% with half-up rounding, done in integer
/// basis points so no floating point ever touches money. The flat fee is
/// tiered: 100 below 2,500, nothing between 2,500 and 5,000, 200 from 5,000.
pub fn commission(gross: i64) -> CommissionBreakdown {
    debug_assert!(gross >= 0, "commission requires a validated amount");

    let rate_fee = (gross * COMMISSION_RATE_BPS + 5_000) / 10_000;
    let flat_fee = if gross < SMALL_ORDER_CEILING {
        SMALL_ORDER_FLAT_FEE
    } else if gross < LARGE_ORDER_FLOOR {
        0
    } else {
        LARGE_ORDER_FLAT_FEE
    };

    let commission = rate_fee + flat_fee;
    CommissionBreakdown {
        gross,
        rate_fee,
        flat_fee,
        commission,
        settle_amount: gross - commission,
    }
}

/// Withdrawal processing fee policy, sourced from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeePolicy {
    pub fee_bps: i64,
    pub fee_min: i64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            fee_bps: 100,
            fee_min: 50,
        }
    }
}

/// Processing fee for a withdrawal: basis points with a floor.
pub fn withdrawal_fee(amount: i64, policy: &FeePolicy) -> i64 {
    let fee = (amount * policy.fee_bps + 5_000) / 10_000;
    fee.max(policy.fee_min)
}
