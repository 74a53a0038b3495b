//! Ether <-> wei at the presentation edge. Nothing below the CLI sees a decimal.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::str::FromStr;
use ticket_api::Wei;

use crate::error::{ClientError, Result};

pub const WEI_DECIMALS: u32 = 18;

/// Parses a human amount such as `0.05` into wei. Rejects negatives and more
/// than 18 fractional digits instead of rounding.
pub fn parse_ether(input: &str) -> Result<Wei> {
    let invalid = || ClientError::InvalidInput(format!("'{}' is not an ether amount", input.trim()));
    let amount = Decimal::from_str(input.trim()).map_err(|_| invalid())?;
    if amount.is_sign_negative() || amount.scale() > WEI_DECIMALS {
        return Err(invalid());
    }
    // Decimal keeps a 96-bit mantissa, so integer and fraction are scaled
    // separately to reach the full wei range.
    let whole = amount.trunc();
    let fraction = amount - whole;
    let whole = whole.to_u128().ok_or_else(invalid)?;
    let fraction_wei = fraction
        .checked_mul(Decimal::from(10u64.pow(WEI_DECIMALS)))
        .and_then(|f| f.trunc().to_u128())
        .ok_or_else(invalid)?;
    whole
        .checked_mul(10u128.pow(WEI_DECIMALS))
        .and_then(|w| w.checked_add(fraction_wei))
        .map(Wei::new)
        .ok_or_else(invalid)
}

/// Renders wei as ether without trailing zeros, e.g. `0.05`.
pub fn format_ether(amount: Wei) -> String {
    let unit = 10u128.pow(WEI_DECIMALS);
    let whole = amount.value() / unit;
    let fraction = amount.value() % unit;
    if fraction == 0 {
        return whole.to_string();
    }
    let digits = format!("{:018}", fraction);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_without_rounding() {
        assert_eq!(parse_ether("1").unwrap(), Wei::new(1_000_000_000_000_000_000));
        assert_eq!(parse_ether("0.05").unwrap(), Wei::new(50_000_000_000_000_000));
        assert_eq!(parse_ether("0.000000000000000001").unwrap(), Wei::new(1));
        assert_eq!(
            parse_ether("123456789.123456789012345678").unwrap(),
            Wei::new(123_456_789_123_456_789_012_345_678)
        );
        assert!(parse_ether("0.0000000000000000001").is_err());
        assert!(parse_ether("-1").is_err());
        assert!(parse_ether("one").is_err());
    }

    #[test]
    fn formats_trimmed() {
        assert_eq!(format_ether(Wei::new(1_000_000_000_000_000_000)), "1");
        assert_eq!(format_ether(Wei::new(50_000_000_000_000_000)), "0.05");
        assert_eq!(format_ether(Wei::new(1)), "0.000000000000000001");
        assert_eq!(format_ether(Wei::ZERO), "0");
    }
}
