//! USD ↔ credits conversion and the product catalogue.
//!
//! 1 credit = $0.001 (1000 credits = $1). Balances stay in USD internally;
//! credits exist for display and the public API.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;

pub const CREDITS_PER_USD: i64 = 1000;

#[derive(Debug, Error, PartialEq)]
pub enum CreditsError {
    #[error("amount cannot be negative")]
    Negative,
    #[error("amount out of range")]
    OutOfRange,
}

/// Convert a USD amount to whole credits with banker's rounding.
pub fn usd_to_credits(usd: Decimal) -> Result<i64, CreditsError> {
    if usd.is_sign_negative() && !usd.is_zero() {
        return Err(CreditsError::Negative);
    }
    (usd * Decimal::from(CREDITS_PER_USD))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        .to_i64()
        .ok_or(CreditsError::OutOfRange)
}

/// Convert whole credits back to a USD amount quantized to 8 fractional digits.
pub fn credits_to_usd(credits: i64) -> Result<Decimal, CreditsError> {
    if credits < 0 {
        return Err(CreditsError::Negative);
    }
    Ok((Decimal::from(credits) / Decimal::from(CREDITS_PER_USD))
        .round_dp_with_strategy(8, RoundingStrategy::MidpointNearestEven))
}

/// Render a USD amount as a credits string, e.g. "5,000 credits" / "1 credit".
pub fn format_credits(usd: Decimal) -> Result<String, CreditsError> {
    let credits = usd_to_credits(usd)?;
    let noun = if credits == 1 { "credit" } else { "credits" };
    Ok(format!("{} {noun}", group_thousands(credits)))
}

/// Render a credit amount (possibly fractional, for sub-unit products).
pub fn format_credit_amount(credits: Decimal) -> String {
    if credits.fract().is_zero() {
        let whole = credits.to_i64().unwrap_or(0);
        let noun = if whole == 1 { "credit" } else { "credits" };
        format!("{} {noun}", group_thousands(whole))
    } else {
        format!("{} credits", credits.normalize())
    }
}

fn group_thousands(n: i64) -> String {
    let digits = n.abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    let first = digits.len() % 3;
    for (i, ch) in digits.chars().enumerate() {
        if i != 0 && (i + 3 - first) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

// ── Product catalogue ──────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ProductInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    /// Credit price per single unit. Fractional for sub-unit products.
    pub credits_per_unit: Decimal,
}

/// Static pricing used for admission; the `products` table is seeded from
/// this and serves the public pricing endpoint.
pub static CATALOGUE: &[ProductInfo] = &[
    ProductInfo {
        id: "chart2csv",
        name: "Chart2CSV",
        unit: "extraction",
        credits_per_unit: dec!(50),
    },
    ProductInfo {
        id: "masker",
        name: "Masker",
        unit: "request",
        credits_per_unit: dec!(1),
    },
    ProductInfo {
        id: "patas",
        name: "PATAS",
        unit: "message",
        credits_per_unit: dec!(0.05),
    },
    ProductInfo {
        id: "reliapi",
        name: "ReliAPI",
        unit: "request",
        credits_per_unit: dec!(0.1),
    },
];

pub fn product_info(id: &str) -> Option<&'static ProductInfo> {
    CATALOGUE.iter().find(|p| p.id == id)
}

/// Credit cost of `units` units of a product.
pub fn credits_for(id: &str, units: i64) -> Option<Decimal> {
    Some(product_info(id)?.credits_per_unit * Decimal::from(units))
}

/// USD cost of `units` units of a product, quantized to 8 fractional digits.
pub fn price_usd(id: &str, units: i64) -> Option<Decimal> {
    let credits = credits_for(id, units)?;
    Some(
        (credits / Decimal::from(CREDITS_PER_USD))
            .round_dp_with_strategy(8, RoundingStrategy::MidpointNearestEven),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_conversion() {
        assert_eq!(usd_to_credits(dec!(1.00)).unwrap(), 1000);
        assert_eq!(usd_to_credits(dec!(5.00)).unwrap(), 5000);
        assert_eq!(usd_to_credits(dec!(0.05)).unwrap(), 50);
        assert_eq!(usd_to_credits(dec!(0.001)).unwrap(), 1);
        assert_eq!(usd_to_credits(dec!(0)).unwrap(), 0);
    }

    #[test]
    fn bankers_rounding_at_the_boundary() {
        // 0.5 credits rounds to 0, 1.5 rounds to 2.
        assert_eq!(usd_to_credits(dec!(0.0005)).unwrap(), 0);
        assert_eq!(usd_to_credits(dec!(0.0015)).unwrap(), 2);
    }

    #[test]
    fn negative_amounts_rejected() {
        assert_eq!(usd_to_credits(dec!(-1)), Err(CreditsError::Negative));
        assert_eq!(credits_to_usd(-100), Err(CreditsError::Negative));
    }

    #[test]
    fn credits_back_to_usd() {
        assert_eq!(credits_to_usd(1000).unwrap(), dec!(1.00000000));
        assert_eq!(credits_to_usd(50).unwrap(), dec!(0.05000000));
        assert_eq!(credits_to_usd(1).unwrap(), dec!(0.00100000));
        assert_eq!(credits_to_usd(0).unwrap(), dec!(0.00000000));
    }

    #[test]
    fn round_trip() {
        for usd in [dec!(0), dec!(0.001), dec!(0.05), dec!(5), dec!(100)] {
            let credits = usd_to_credits(usd).unwrap();
            assert_eq!(credits_to_usd(credits).unwrap(), usd);
        }
    }

    #[test]
    fn formatting() {
        assert_eq!(format_credits(dec!(5.00)).unwrap(), "5,000 credits");
        assert_eq!(format_credits(dec!(0.001)).unwrap(), "1 credit");
        assert_eq!(format_credits(dec!(100.00)).unwrap(), "100,000 credits");
        assert_eq!(format_credit_amount(dec!(0.1)), "0.1 credits");
        assert_eq!(format_credit_amount(dec!(1)), "1 credit");
    }

    #[test]
    fn catalogue_prices() {
        assert_eq!(price_usd("chart2csv", 1).unwrap(), dec!(0.05));
        assert_eq!(price_usd("masker", 1).unwrap(), dec!(0.001));
        // 100 messages cost 5 credits.
        assert_eq!(credits_for("patas", 100).unwrap(), dec!(5));
        assert_eq!(price_usd("patas", 100).unwrap(), dec!(0.005));
        assert_eq!(credits_for("reliapi", 1).unwrap(), dec!(0.1));
        assert!(product_info("unknown").is_none());
    }
}
