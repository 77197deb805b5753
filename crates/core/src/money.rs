use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Neg;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Amount out of range: {0}")]
    OutOfRange(String),
}

/// An amount in integer minor units (cents). All arithmetic and comparison
/// inside the pipeline happens on this integer representation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    /// Parse a bank-export amount cell into minor units.
    ///
    /// Accepts accounting parentheses for negatives, currency symbols, and
    /// thousands separators. With `decimal_comma` set, `1.234,56` style
    /// amounts are read the continental way.
    pub fn parse(s: &str, decimal_comma: bool) -> Result<Self, MoneyError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MoneyError::InvalidAmount(s.to_string()));
        }

        let (negative, s) = if s.starts_with('(') && s.ends_with(')') {
            (true, &s[1..s.len() - 1])
        } else {
            (false, s)
        };

        let cleaned: String = s
            .chars()
            .filter(|c| !matches!(c, '$' | '€' | '£' | ' ' | '\u{a0}' | '\''))
            .collect();
        let cleaned = if decimal_comma {
            cleaned.replace('.', "").replace(',', ".")
        } else {
            cleaned.replace(',', "")
        };

        let mut dec = Decimal::from_str(&cleaned)
            .map_err(|_| MoneyError::InvalidAmount(s.to_string()))?;
        if negative {
            dec = -dec;
        }
        let minor = (dec * Decimal::from(100))
            .round()
            .to_i64()
            .ok_or_else(|| MoneyError::OutOfRange(s.to_string()))?;
        Ok(Money(minor))
    }

    /// Round to the nearest ten major units (nearest 1000 minor units),
    /// half away from zero. This is the coarsening used by fuzzy
    /// fingerprint keys.
    pub fn round_to_major_tens(self) -> i64 {
        const STEP: i64 = 1000;
        let half = if self.0 >= 0 { STEP / 2 } else { -(STEP / 2) };
        ((self.0 + half) / STEP) * STEP
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self {
        Money(-self.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}
