//! Value objects: equality by value, not identity.
//!
//! Value objects are domain objects that have **no identity** - they are defined entirely
//! by their attribute values. Two value objects with the same values are considered equal.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. To "modify" one,
/// construct a new one. Construction is where validation happens, so holding a
/// value object means holding a valid value.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// Business identifier of a person: `TAX` followed by exactly three digits.
///
/// This is the partitioning key on the broker and the key of every coordination
/// entry, so it must be canonical (trimmed, validated) before it is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaxNumber(String);

impl TaxNumber {
    const PREFIX: &'static str = "TAX";
    const DIGITS: usize = 3;

    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("tax number must not be empty"));
        }

        let digits = trimmed
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| DomainError::validation(format!("tax number {trimmed} must start with TAX")))?;

        if digits.len() != Self::DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "tax number {trimmed} must be TAX followed by {} digits",
                Self::DIGITS
            )));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for TaxNumber {}

impl core::fmt::Display for TaxNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaxNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaxNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaxNumber> for String {
    fn from(value: TaxNumber) -> Self {
        value.0
    }
}

/// A positive debt amount in minor units (cents).
///
/// Bounds: 0.01 ..= 999,999.99.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct DebtAmount(u64);

impl DebtAmount {
    pub const MIN_CENTS: u64 = 1;
    pub const MAX_CENTS: u64 = 99_999_999;

    pub fn from_cents(cents: u64) -> DomainResult<Self> {
        if cents < Self::MIN_CENTS {
            return Err(DomainError::validation("debt amount must be greater than 0"));
        }
        if cents > Self::MAX_CENTS {
            return Err(DomainError::validation("debt amount cannot exceed 999,999.99"));
        }
        Ok(Self(cents))
    }

    pub fn cents(&self) -> u64 {
        self.0
    }
}

impl ValueObject for DebtAmount {}

impl core::fmt::Display for DebtAmount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl TryFrom<u64> for DebtAmount {
    type Error = DomainError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::from_cents(value)
    }
}

impl From<DebtAmount> for u64 {
    fn from(value: DebtAmount) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tax_number_accepts_canonical_form_and_trims() {
        let tax = TaxNumber::parse("  TAX123 ").unwrap();
        assert_eq!(tax.as_str(), "TAX123");
    }

    #[test]
    fn tax_number_rejects_bad_shapes() {
        for raw in ["", "   ", "TAX12", "TAX1234", "tax123", "TAXabc", "XYZ123"] {
            assert!(
                matches!(TaxNumber::parse(raw), Err(DomainError::Validation(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn tax_number_deserialization_validates() {
        let ok: TaxNumber = serde_json::from_str("\"TAX001\"").unwrap();
        assert_eq!(ok.as_str(), "TAX001");
        assert!(serde_json::from_str::<TaxNumber>("\"nope\"").is_err());
    }

    #[test]
    fn debt_amount_bounds() {
        assert!(DebtAmount::from_cents(0).is_err());
        assert!(DebtAmount::from_cents(1).is_ok());
        assert!(DebtAmount::from_cents(99_999_999).is_ok());
        assert!(DebtAmount::from_cents(100_000_000).is_err());
    }

    #[test]
    fn debt_amount_displays_as_decimal() {
        assert_eq!(DebtAmount::from_cents(12_345).unwrap().to_string(), "123.45");
        assert_eq!(DebtAmount::from_cents(7).unwrap().to_string(), "0.07");
    }
}
