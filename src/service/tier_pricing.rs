// service/tier_pricing.rs
use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};

use crate::{
    models::proposalmodel::GbbTier,
    service::error::ServiceError,
    utils::money::round2,
};

/// Price multiplier applied to the base total for each tier.
pub fn multiplier(tier: GbbTier) -> BigDecimal {
    match tier {
        GbbTier::Good => BigDecimal::new(85.into(), 2),
        GbbTier::Better => BigDecimal::new(100.into(), 2),
        GbbTier::Best => BigDecimal::new(115.into(), 2),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierPrice {
    pub total: BigDecimal,
    pub deposit: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierPricing {
    pub good: TierPrice,
    pub better: TierPrice,
    pub best: TierPrice,
}

impl TierPricing {
    pub fn for_tier(&self, tier: GbbTier) -> &TierPrice {
        match tier {
            GbbTier::Good => &self.good,
            GbbTier::Better => &self.better,
            GbbTier::Best => &self.best,
        }
    }
}

/// Derives every tier's total and deposit from the base total.
///
/// Both steps round half-up to cents, and the deposit is taken from the
/// already rounded total, so a quote, its invoice and the payment check
/// always agree to the cent.
pub fn compute_tiers(
    base_total: &BigDecimal,
    deposit_percent: &BigDecimal,
) -> Result<TierPricing, ServiceError> {
    if base_total < &BigDecimal::zero() {
        return Err(ServiceError::InvalidPricingInput(format!(
            "base total must not be negative, got {}",
            base_total
        )));
    }
    if deposit_percent < &BigDecimal::zero() || deposit_percent > &BigDecimal::from(100) {
        return Err(ServiceError::InvalidPricingInput(format!(
            "deposit percentage must be between 0 and 100, got {}",
            deposit_percent
        )));
    }

    let price = |tier: GbbTier| {
        let total = round2(&(base_total * multiplier(tier)));
        let deposit = round2(&(&total * deposit_percent / BigDecimal::from(100)));
        TierPrice { total, deposit }
    };

    Ok(TierPricing {
        good: price(GbbTier::Good),
        better: price(GbbTier::Better),
        best: price(GbbTier::Best),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_thousand_at_half_deposit() {
        let tiers = compute_tiers(&dec("1000.00"), &dec("50")).unwrap();

        assert_eq!(tiers.better, TierPrice { total: dec("1000.00"), deposit: dec("500.00") });
        assert_eq!(tiers.good, TierPrice { total: dec("850.00"), deposit: dec("425.00") });
        assert_eq!(tiers.best, TierPrice { total: dec("1150.00"), deposit: dec("575.00") });
    }

    #[test]
    fn test_tiers_are_monotonic_and_deposits_exact() {
        let bases = ["0", "0.01", "1.99", "333.33", "1234.56", "99999.99", "7.07"];
        let percents = ["0", "12.5", "33.333", "50", "100"];

        for base in bases {
            for pct in percents {
                let pct = dec(pct);
                let tiers = compute_tiers(&dec(base), &pct).unwrap();
                assert!(tiers.good.total <= tiers.better.total, "base {}", base);
                assert!(tiers.better.total <= tiers.best.total, "base {}", base);

                for tier in GbbTier::ALL {
                    let price = tiers.for_tier(tier);
                    let expected = round2(&(&price.total * &pct / BigDecimal::from(100)));
                    assert_eq!(price.deposit, expected);
                }
            }
        }
    }

    #[test]
    fn test_rounding_is_half_up_per_step() {
        // 333.33 * 0.85 = 283.3305 -> 283.33; 283.33 * 0.5 = 141.665 -> 141.67
        let tiers = compute_tiers(&dec("333.33"), &dec("50")).unwrap();
        assert_eq!(tiers.good.total, dec("283.33"));
        assert_eq!(tiers.good.deposit, dec("141.67"));

        // 0.05 * 1.15 = 0.0575 -> 0.06
        let tiers = compute_tiers(&dec("0.05"), &dec("100")).unwrap();
        assert_eq!(tiers.best.total, dec("0.06"));
        assert_eq!(tiers.best.deposit, dec("0.06"));
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            compute_tiers(&dec("-1"), &dec("50")),
            Err(ServiceError::InvalidPricingInput(_))
        ));
        assert!(matches!(
            compute_tiers(&dec("100"), &dec("100.01")),
            Err(ServiceError::InvalidPricingInput(_))
        ));
        assert!(matches!(
            compute_tiers(&dec("100"), &dec("-5")),
            Err(ServiceError::InvalidPricingInput(_))
        ));
    }
}
