//! Profit scoring and ranking.
//!
//! Pure functions of the listed price and the resolved market price.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cmp::Ordering;

use crate::types::{Deal, ProfitScore};

/// Minimum profit percentage for a deal to be flagged profitable.
pub const DEFAULT_PROFIT_THRESHOLD: Decimal = dec!(20);

/// Score a purchase at `retail` against a resale value of `market`.
///
/// Non-positive prices yield a zero, unprofitable score.
pub fn score(retail: Decimal, market: Decimal, threshold: Decimal) -> ProfitScore {
    if retail <= Decimal::ZERO || market <= Decimal::ZERO {
        return ProfitScore::ZERO;
    }

    let profit_amount = market - retail;
    // Threshold is checked against the exact ratio; only the stored figure is rounded.
    let exact = profit_amount / retail * dec!(100);

    ProfitScore {
        profit_amount,
        profit_percentage: exact.round_dp(2),
        is_profitable: exact >= threshold,
    }
}

/// Order deals by descending profit amount, then descending percentage.
pub fn rank(mut deals: Vec<Deal>) -> Vec<Deal> {
    deals.sort_by(compare_profit);
    deals
}

fn compare_profit(a: &Deal, b: &Deal) -> Ordering {
    let (pa, pb) = (a.profit(), b.profit());
    pb.profit_amount
        .cmp(&pa.profit_amount)
        .then_with(|| pb.profit_percentage.cmp(&pa.profit_percentage))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
