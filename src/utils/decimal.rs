//! Decimal arithmetic utilities for collateral amounts.

use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places accepted by the SAPI earn and loan endpoints.
pub const ASSET_PRECISION: u32 = 8;

/// Round down to `decimals` places, never up.
///
/// Used wherever rounding up could overdraw a source or breach a ceiling.
pub fn floor_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Clamp negative values to zero.
pub fn non_negative(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO)
}
