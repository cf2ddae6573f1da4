//! Resource quantities in the Kubernetes text convention.
//!
//! A [`Quantity`] keeps the text it was parsed from (so `16777220Ki` reads
//! back as `16777220Ki`) and an exact value in milli-units used for
//! comparison and arithmetic. Fractions below one milli-unit round up.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resource name → amount, e.g. `cpu` → `4`, `memory` → `16Gi`.
pub type ResourceList = BTreeMap<String, Quantity>;

/// Longest mantissa accepted; keeps all intermediate math inside `i128`.
const MAX_DIGITS: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("unknown quantity suffix {suffix:?} in {text:?}")]
    UnknownSuffix { text: String, suffix: String },

    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// A parsed resource quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity {
    millis: i128,
    text: String,
}

enum Scale {
    Binary(u32),
    Decimal(i32),
}

impl Quantity {
    /// Parse quantity text such as `4`, `500m`, `1.5Gi` or `1e3`.
    pub fn parse(text: &str) -> Result<Self, QuantityError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, body) = match text.as_bytes()[0] {
            b'-' => (true, &text[1..]),
            b'+' => (false, &text[1..]),
            _ => (false, text),
        };

        let number_len = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let (number, suffix) = body.split_at(number_len);

        let (whole, fraction) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(QuantityError::Invalid(text.to_string()));
        }
        if fraction.contains('.') || whole.len() + fraction.len() > MAX_DIGITS {
            return Err(QuantityError::Invalid(text.to_string()));
        }

        let digits = format!("{whole}{fraction}");
        let mantissa: i128 = digits
            .parse()
            .map_err(|_| QuantityError::Invalid(text.to_string()))?;

        let scale = parse_suffix(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
            text: text.to_string(),
            suffix: suffix.to_string(),
        })?;

        let out_of_range = || QuantityError::OutOfRange(text.to_string());
        let mut numerator = mantissa.checked_mul(1000).ok_or_else(out_of_range)?;
        let mut denominator = pow10(fraction.len() as u32).ok_or_else(out_of_range)?;
        match scale {
            Scale::Binary(shift) => {
                numerator = numerator
                    .checked_mul(1i128 << shift)
                    .ok_or_else(out_of_range)?;
            }
            Scale::Decimal(exp) if exp >= 0 => {
                let factor = pow10(exp as u32).ok_or_else(out_of_range)?;
                numerator = numerator.checked_mul(factor).ok_or_else(out_of_range)?;
            }
            Scale::Decimal(exp) => {
                let factor = pow10(exp.unsigned_abs()).ok_or_else(out_of_range)?;
                denominator = denominator.checked_mul(factor).ok_or_else(out_of_range)?;
            }
        }

        // Round the magnitude up to the next whole milli-unit.
        let magnitude = numerator
            .checked_add(denominator - 1)
            .ok_or_else(out_of_range)?
            / denominator;
        let millis = if negative { -magnitude } else { magnitude };

        Ok(Self {
            millis,
            text: text.to_string(),
        })
    }

    /// A quantity of whole units, e.g. `Quantity::from_units(4)` is `4`.
    pub fn from_units(units: i64) -> Self {
        Self::from_millis(i128::from(units) * 1000)
    }

    /// A quantity from milli-units, rendered in canonical text.
    pub fn from_millis(millis: i128) -> Self {
        let text = if millis % 1000 == 0 {
            (millis / 1000).to_string()
        } else {
            format!("{millis}m")
        };
        Self { millis, text }
    }

    pub fn zero() -> Self {
        Self::from_millis(0)
    }

    pub fn millis(&self) -> i128 {
        self.millis
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    /// The text this quantity was parsed from.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// `self - other`, floored at zero.
    pub fn saturating_sub(&self, other: &Quantity) -> Quantity {
        if other.is_zero() {
            return self.clone();
        }
        Self::from_millis((self.millis - other.millis).max(0))
    }
}

fn parse_suffix(suffix: &str) -> Option<Scale> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        other => {
            // Decimal exponent: `1e3`, `2E-2`.
            let exp = other.strip_prefix(['e', 'E'])?;
            Scale::Decimal(exp.parse::<i32>().ok().filter(|e| e.abs() <= 18)?)
        }
    };
    Some(scale)
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.millis.cmp(&other.millis)
    }
}

impl std::hash::Hash for Quantity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.millis.hash(state);
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Quantity {
    type Error = QuantityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.text
    }
}
