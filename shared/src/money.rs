use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const MONEY_DECIMALS: u32 = 3;
pub const MILLIS_PER_UNIT: u64 = 1_000; // 10^3

/// Non-negative amount of money in thousandths of a dollar.
///
/// Payouts are displayed as `$X.XXX`, so three decimal places are stored
/// exactly and repeated small credits never drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(u64);

impl Money {
    pub const ZERO: Self = Self(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn from_dollars(dollars: u64) -> Self {
        Self(dollars * MILLIS_PER_UNIT)
    }

    pub fn millis(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    /// `count` copies of this amount, e.g. a payout times its slots.
    pub fn checked_mul(&self, count: u32) -> Option<Self> {
        self.0.checked_mul(u64::from(count)).map(Self)
    }

    /// Nearest thousandth of a floating point dollar value.
    pub fn from_f64(dollars: f64) -> Result<Self, ParseMoneyError> {
        if !dollars.is_finite() || dollars < 0.0 {
            return Err(ParseMoneyError(dollars.to_string()));
        }
        let millis = (dollars * MILLIS_PER_UNIT as f64).round();
        if millis > u64::MAX as f64 {
            return Err(ParseMoneyError(dollars.to_string()));
        }
        Ok(Self(millis as u64))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:03}",
            self.0 / MILLIS_PER_UNIT,
            self.0 % MILLIS_PER_UNIT
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid money amount: {0:?}")]
pub struct ParseMoneyError(pub String);

impl FromStr for Money {
    type Err = ParseMoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().trim_start_matches('$');
        let err = || ParseMoneyError(s.to_string());

        let (whole, frac) = match raw.split_once('.') {
            Some((w, f)) => (w, f),
            None => (raw, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if frac.len() > MONEY_DECIMALS as usize {
            return Err(err());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }

        let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| err())? };
        let mut frac_millis: u64 = if frac.is_empty() { 0 } else { frac.parse().map_err(|_| err())? };
        for _ in frac.len()..MONEY_DECIMALS as usize {
            frac_millis *= 10;
        }

        whole
            .checked_mul(MILLIS_PER_UNIT)
            .and_then(|m| m.checked_add(frac_millis))
            .map(Self)
            .ok_or_else(err)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MoneyVisitor;

        impl<'de> de::Visitor<'de> for MoneyVisitor {
            type Value = Money;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a non-negative decimal amount with at most 3 fractional digits")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Money, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Money, E> {
                v.checked_mul(MILLIS_PER_UNIT)
                    .map(Money)
                    .ok_or_else(|| E::custom("amount out of range"))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Money, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom("amount must not be negative"))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Money, E> {
                Money::from_f64(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(MoneyVisitor)
    }
}
