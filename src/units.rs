// src/units.rs
use alloy::primitives::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Largest scale rust_decimal can carry.
const MAX_SCALE: u8 = 28;

/// Convert raw token units into a human-readable decimal (like `formatEther`).
///
/// Returns `None` when the value does not fit a 96-bit decimal mantissa.
pub fn from_base_units(raw: U256, decimals: u8) -> Option<Decimal> {
    if decimals > MAX_SCALE {
        return None;
    }
    let raw = u128::try_from(raw).ok()?;
    let raw = i128::try_from(raw).ok()?;
    Decimal::try_from_i128_with_scale(raw, decimals as u32)
        .ok()
        .map(|d| d.normalize())
}

/// Convert a human-readable amount into raw token units.
///
/// Fails for negative amounts and amounts with more fractional digits than the
/// token supports.
pub fn to_base_units(amount: Decimal, decimals: u8) -> Option<U256> {
    if amount.is_sign_negative() || decimals > MAX_SCALE {
        return None;
    }
    let factor = Decimal::from_i128_with_scale(10i128.pow(decimals as u32), 0);
    let scaled = amount.checked_mul(factor)?;
    if scaled.fract() != Decimal::ZERO {
        return None;
    }
    scaled.to_u128().map(U256::from)
}
