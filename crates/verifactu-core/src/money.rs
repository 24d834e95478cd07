// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fixed-point monetary rounding (spec §4.A, §8 boundary cases).
//!
//! AEAT amounts are always two fractional digits, half-up rounded at
//! ingress; the canonical hash input must never re-round. This module is
//! the single place that rounding happens.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round `amount` to two fractional digits using half-up ("round half away
/// from zero") rounding, matching the AEAT spec's `CuotaTotal`/`ImporteTotal`
/// formatting rule.
///
/// # Examples
///
/// ```
/// use rust_decimal_macros::dec;
/// use verifactu_core::money::round_money;
///
/// assert_eq!(round_money(dec!(100.125)), dec!(100.13));
/// assert_eq!(round_money(dec!(100.135)), dec!(100.14));
/// assert_eq!(round_money(dec!(0)), dec!(0.00));
/// ```
#[must_use]
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Format a monetary amount the way the canonical hash input and XML wire
/// format require: two fractional digits, `.` separator, no thousands
/// separator. Does not re-round — callers must have already rounded via
/// [`round_money`].
#[must_use]
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn half_up_rounding() {
        assert_eq!(round_money(dec!(100.125)), dec!(100.13));
        assert_eq!(round_money(dec!(100.135)), dec!(100.14));
    }

    #[test]
    fn zero_tax_formats_with_two_decimals() {
        assert_eq!(format_amount(round_money(dec!(0))), "0.00");
    }

    #[test]
    fn format_is_stable_after_round() {
        let a = round_money(dec!(121));
        assert_eq!(format_amount(a), "121.00");
    }
}
