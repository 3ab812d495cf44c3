//! Non-negative decimal quantities (metres, kilograms, pieces).

use core::ops::{Add, Sub};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// A quantity of material that can never be negative.
///
/// Construction goes through [`Quantity::new`], which names the offending field on
/// failure so callers can surface it unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

impl ValueObject for Quantity {}

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    pub fn new(field: &str, value: Decimal) -> DomainResult<Self> {
        if value < Decimal::ZERO {
            return Err(DomainError::invalid_quantity(
                field,
                format!("must not be negative (got {value})"),
            ));
        }
        Ok(Self(value.normalize()))
    }

    pub fn value(self) -> Decimal {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// `max(0, self - other)`.
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        if self.0 > other.0 {
            Quantity(self.0 - other.0)
        } else {
            Quantity::ZERO
        }
    }

    pub fn min(self, other: Quantity) -> Quantity {
        if self.0 <= other.0 { self } else { other }
    }

    /// Monetary value of this quantity at `rate`.
    pub fn value_at(self, rate: Decimal) -> Decimal {
        self.0 * rate
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl Sub for Quantity {
    type Output = Decimal;

    /// Signed difference; use [`Quantity::saturating_sub`] to stay non-negative.
    fn sub(self, rhs: Quantity) -> Decimal {
        self.0 - rhs.0
    }
}

impl core::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Self {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Quantity::new("quantity", value)
    }
}

impl From<Quantity> for Decimal {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

impl From<u32> for Quantity {
    fn from(value: u32) -> Self {
        Quantity(Decimal::from(value))
    }
}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn negative_values_are_rejected_with_field_name() {
        let err = Quantity::new("received_quantity", dec!(-0.5)).unwrap_err();
        assert_eq!(
            err,
            DomainError::invalid_quantity("received_quantity", "must not be negative (got -0.5)")
        );
    }

    #[test]
    fn negative_zero_is_zero() {
        let q = Quantity::new("q", dec!(-0.0)).unwrap();
        assert!(q.is_zero());
    }

    #[test]
    fn saturating_sub_never_goes_below_zero() {
        let a = Quantity::from(10);
        let b = Quantity::from(15);
        assert_eq!(a.saturating_sub(b), Quantity::ZERO);
        assert_eq!(b.saturating_sub(a), Quantity::from(5));
    }

    #[test]
    fn deserialization_enforces_non_negative() {
        let ok: Quantity = serde_json::from_str("\"12.50\"").unwrap();
        assert_eq!(ok.value(), dec!(12.5));
        assert!(serde_json::from_str::<Quantity>("\"-1\"").is_err());
    }
}
