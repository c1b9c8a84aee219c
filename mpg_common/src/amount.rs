use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign, Mul, Sub},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sqlx::Type;
use thiserror::Error;

use crate::op;

pub const CNY_CURRENCY_CODE: &str = "CNY";

//--------------------------------------       Amount        ---------------------------------------------------------
/// A monetary value in fen (1/100 of a yuan).
///
/// Amounts are stored as integers so that no rounding ever happens inside the system. Conversion to the
/// representation a payment provider expects happens at the boundary: Alipay wants the decimal yuan string
/// ([`Amount::to_yuan_string`]), WeChat Pay wants integer fen ([`Amount::fen`]).
#[derive(Debug, Clone, Copy, Default, Type, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[sqlx(transparent)]
pub struct Amount(i64);

op!(binary Amount, Add, add);
op!(binary Amount, Sub, sub);
op!(inplace Amount, AddAssign, add_assign);

impl Mul<i64> for Amount {
    type Output = Self;

    fn mul(self, rhs: i64) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Value cannot be represented as a yuan amount: {0}")]
pub struct AmountConversionError(String);

impl From<i64> for Amount {
    fn from(fen: i64) -> Self {
        Self(fen)
    }
}

impl Amount {
    pub fn from_fen(fen: i64) -> Self {
        Self(fen)
    }

    pub fn from_yuan(yuan: i64) -> Self {
        Self(yuan * 100)
    }

    pub fn fen(&self) -> i64 {
        self.0
    }

    /// Renders the amount as a decimal yuan string with exactly two decimal places, e.g. `30.00`.
    pub fn to_yuan_string(&self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        format!("{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "¥{}", self.to_yuan_string())
    }
}

impl FromStr for Amount {
    type Err = AmountConversionError;

    /// Parses a non-negative decimal yuan value with at most two decimal places, e.g. `30`, `30.5` or `30.05`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || AmountConversionError(s.to_string());
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        let whole = whole.parse::<i64>().map_err(|_| err())?;
        let frac = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| err())? * 10,
            _ => frac.parse::<i64>().map_err(|_| err())?,
        };
        whole.checked_mul(100).and_then(|v| v.checked_add(frac)).map(Self).ok_or_else(err)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_yuan_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
