//! Fixed-point numeric types shared by the whole engine.
//!
//! All on-ledger quantities are raw 8-decimal integers (e8s): collateral
//! amounts ([`Tokens`]), kUSD amounts and USD values ([`KUSD`], the peg makes
//! them interchangeable), and feed quotes ([`UsdPrice`], USD per whole
//! token). Solvency ratios ([`HealthFactor`]) are scaled by 10^18.
//!
//! Conversions multiply before they divide, through `u128` intermediates, so
//! no precision is lost ahead of the final floor division. Overflow traps.

use candid::{CandidType, Nat};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

use crate::{ADDITIONAL_FEED_PRECISION, PRECISION};

/// An amount of a collateral token, in e8s.
#[derive(
    CandidType,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
)]
pub struct Tokens(u64);

/// An amount of kUSD, in e8s. Since kUSD is pegged 1:1 to the value unit,
/// this type also denominates USD values of collateral.
#[derive(
    CandidType,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
)]
pub struct KUSD(u64);

/// A USD price for one whole token, as an 8-decimal fixed-point quote.
#[derive(CandidType, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsdPrice(u64);

/// A 10^18-scaled solvency ratio: threshold-adjusted collateral value over
/// outstanding debt.
#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HealthFactor(u128);

impl Tokens {
    pub const fn new(e8s: u64) -> Self {
        Self(e8s)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn to_nat(self) -> Nat {
        Nat::from(self.0)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }
}

impl KUSD {
    pub const fn new(e8s: u64) -> Self {
        Self(e8s)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn to_nat(self) -> Nat {
        Nat::from(self.0)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }
}

impl UsdPrice {
    pub const fn new(e8s: u64) -> Self {
        Self(e8s)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// The quote scaled from the 8-decimal feed representation up to the
    /// internal 10^18 precision. This is the only place the feed precision
    /// and the internal precision meet.
    fn to_internal_precision(self) -> u128 {
        (self.0 as u128)
            .checked_mul(ADDITIONAL_FEED_PRECISION)
            .expect("price normalization overflow")
    }
}

impl HealthFactor {
    /// Sentinel for positions with no debt: unconditionally healthy.
    pub const MAX: HealthFactor = HealthFactor(u128::MAX);

    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    pub fn to_u128(self) -> u128 {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        if self == Self::MAX {
            return f64::INFINITY;
        }
        self.0 as f64 / PRECISION as f64
    }
}

/// `value = (price * 10^10) * amount / 10^18`, flooring once at the end.
impl Mul<UsdPrice> for Tokens {
    type Output = KUSD;

    fn mul(self, price: UsdPrice) -> KUSD {
        let value = price
            .to_internal_precision()
            .checked_mul(self.0 as u128)
            .expect("collateral value overflow")
            / PRECISION;
        KUSD(u64::try_from(value).expect("collateral value does not fit in 64 bits"))
    }
}

/// `amount = value * 10^18 / (price * 10^10)`, flooring once at the end.
/// Callers guarantee a positive price; the oracle adapter rejects zero quotes.
impl Div<UsdPrice> for KUSD {
    type Output = Tokens;

    fn div(self, price: UsdPrice) -> Tokens {
        let scaled_price = price.to_internal_precision();
        assert!(scaled_price > 0, "cannot divide by a zero price");
        let amount = (self.0 as u128)
            .checked_mul(PRECISION)
            .expect("value scaling overflow")
            / scaled_price;
        Tokens(u64::try_from(amount).expect("token amount does not fit in 64 bits"))
    }
}

macro_rules! impl_amount_ops {
    ($ty:ident) => {
        impl Add for $ty {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0.checked_add(rhs.0).expect("amount overflow"))
            }
        }

        impl AddAssign for $ty {
            fn add_assign(&mut self, rhs: Self) {
                *self = *self + rhs;
            }
        }

        impl Sub for $ty {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0.checked_sub(rhs.0).expect("amount underflow"))
            }
        }

        impl SubAssign for $ty {
            fn sub_assign(&mut self, rhs: Self) {
                *self = *self - rhs;
            }
        }

        impl Sum for $ty {
            fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
                iter.fold(Self(0), Add::add)
            }
        }

        impl From<u64> for $ty {
            fn from(e8s: u64) -> Self {
                Self(e8s)
            }
        }

        impl PartialEq<u64> for $ty {
            fn eq(&self, other: &u64) -> bool {
                self.0 == *other
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let units = Decimal::from(self.0) / dec!(100_000_000);
                write!(f, "{}", units.normalize())
            }
        }
    };
}

impl_amount_ops!(Tokens);
impl_amount_ops!(KUSD);

impl fmt::Display for UsdPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = Decimal::from(self.0) / dec!(100_000_000);
        write!(f, "{}", units.normalize())
    }
}

impl fmt::Display for HealthFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MAX {
            return write!(f, "inf");
        }
        write!(f, "{:.4}", self.to_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::E8S;

    #[test]
    fn usd_value_multiplies_before_dividing() {
        // 15 tokens at $2,000 each: 30,000 USD in e8s.
        let amount = Tokens::new(15 * E8S);
        let price = UsdPrice::new(2_000 * E8S);
        assert_eq!(amount * price, KUSD::new(30_000 * E8S));
    }

    #[test]
    fn sub_e8s_amounts_keep_precision() {
        // 0.00000001 token at $2,000: floors to 0.00002 USD, not to zero.
        let amount = Tokens::new(1);
        let price = UsdPrice::new(2_000 * E8S);
        assert_eq!(amount * price, KUSD::new(2_000));
    }

    #[test]
    fn quantity_from_value_inverts_the_quote() {
        // $100 of a $2,000 token is 0.05 tokens.
        let value = KUSD::new(100 * E8S);
        let price = UsdPrice::new(2_000 * E8S);
        assert_eq!(value / price, Tokens::new(5_000_000));
    }

    #[test]
    fn tiny_values_floor_to_zero_tokens() {
        let value = KUSD::new(1);
        let price = UsdPrice::new(2_000 * E8S);
        assert_eq!(value / price, Tokens::new(0));
    }

    #[test]
    fn displays_trim_trailing_zeros() {
        assert_eq!(KUSD::new(150_000_000).to_string(), "1.5");
        assert_eq!(Tokens::new(1).to_string(), "0.00000001");
        assert_eq!(UsdPrice::new(2_000 * E8S).to_string(), "2000");
    }

    #[test]
    fn health_factor_sentinel_displays_as_inf() {
        assert_eq!(HealthFactor::MAX.to_string(), "inf");
        assert_eq!(HealthFactor::new(PRECISION).to_string(), "1.0000");
        assert!(HealthFactor::MAX.to_f64().is_infinite());
    }
}
