//! Arbitrary-precision, non-negative value type
//!
//! Every operation returns a new `Amount`; nothing here can overflow, and the
//! only fallible arithmetic is subtraction (underflow) and division (by zero).

use crate::{CoreError, Result};
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

/// A non-negative integer quantity of ledger value
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(BigUint);

impl Amount {
    /// The zero amount
    pub fn zero() -> Self {
        Amount(BigUint::zero())
    }

    /// Create an amount from a machine integer
    pub fn from_u64(value: u64) -> Self {
        Amount(BigUint::from(value))
    }

    /// Parse a decimal string, or a hex string when prefixed with `0x`
    pub fn from_string(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => BigUint::parse_bytes(hex.as_bytes(), 16),
            None => BigUint::parse_bytes(trimmed.as_bytes(), 10),
        };
        parsed
            .map(Amount)
            .ok_or_else(|| CoreError::InvalidAmount(s.to_string()))
    }

    /// Decode from canonical big-endian bytes. An empty slice is zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Amount(BigUint::from_bytes_be(bytes))
    }

    /// Convert from a signed big integer, failing on negative values
    pub fn from_big_int(value: &BigInt) -> Result<Self> {
        match value.sign() {
            Sign::Minus => Err(CoreError::AmountUnderflow),
            _ => Ok(Amount(value.magnitude().clone())),
        }
    }

    /// Canonical big-endian bytes; zero encodes as an empty vector
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.0.is_zero() {
            Vec::new()
        } else {
            self.0.to_bytes_be()
        }
    }

    /// Borrow the underlying big integer
    pub fn as_big_uint(&self) -> &BigUint {
        &self.0
    }

    /// Value as `u64` if it fits
    pub fn to_u64(&self) -> Option<u64> {
        self.0.to_u64()
    }

    #[must_use]
    pub fn add(&self, other: &Amount) -> Amount {
        Amount(&self.0 + &other.0)
    }

    /// Subtract, failing with `AmountUnderflow` if `other` is larger
    pub fn sub(&self, other: &Amount) -> Result<Amount> {
        if self.0 < other.0 {
            return Err(CoreError::AmountUnderflow);
        }
        Ok(Amount(&self.0 - &other.0))
    }

    #[must_use]
    pub fn mul(&self, other: &Amount) -> Amount {
        Amount(&self.0 * &other.0)
    }

    /// Multiply by a scalar
    #[must_use]
    pub fn times(&self, scalar: u64) -> Amount {
        Amount(&self.0 * BigUint::from(scalar))
    }

    /// Integer division by a scalar, truncating
    pub fn div(&self, scalar: u64) -> Result<Amount> {
        if scalar == 0 {
            return Err(CoreError::DivisionByZero);
        }
        Ok(Amount(&self.0 / BigUint::from(scalar)))
    }

    /// Three-way comparison
    pub fn compare(&self, other: &Amount) -> Ordering {
        self.0.cmp(&other.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount::from_u64(value)
    }
}

impl FromStr for Amount {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Amount::from_string(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, x| acc.add(x))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, x| acc.add(&x))
    }
}

// Decimal strings keep amounts lossless in JSON and TOML as well as bincode.
impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_str_radix(10))
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::from_string(&s).map_err(serde::de::Error::custom)
    }
}
