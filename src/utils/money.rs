//! Money helpers for proposal amounts.
//!
//! Amounts are `BigDecimal` in major units (dollars) everywhere inside the
//! service and only become integer minor units (cents) at the payment
//! processor boundary.
use bigdecimal::{BigDecimal, RoundingMode};
use num_traits::ToPrimitive;

/// Round half-up to two decimal places.
pub fn round2(value: &BigDecimal) -> BigDecimal {
    value.with_scale_round(2, RoundingMode::HalfUp)
}

/// Convert a major-unit amount into processor minor units, rounding half-up.
pub fn to_minor_units(amount: &BigDecimal) -> Option<i64> {
    let hundred = BigDecimal::from(100);
    (amount * &hundred)
        .with_scale_round(0, RoundingMode::HalfUp)
        .to_i64()
}

/// Format an amount for emails, e.g. `1,150.00 USD`
pub fn format_money(amount: &BigDecimal, currency: &str) -> String {
    let rounded = round2(amount).to_string();
    let (whole, fraction) = rounded.split_once('.').unwrap_or((rounded.as_str(), "00"));
    let (sign, digits) = match whole.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", whole),
    };

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!("{}{}.{} {}", sign, grouped, fraction, currency.to_uppercase())
}
