use std::fmt;
use std::ops::{Add, Sub};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of decimal places every [`Amount`] is normalized to.
const SCALE: u32 = 4;

/// Errors produced while parsing monetary text.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseAmountError {
  #[error("not a decimal number: {0}")]
  Invalid(String),

  #[error("more than {SCALE} decimal places: {0}")]
  TooPrecise(String),
}

/// Exact monetary value with a fixed scale of 4 decimal places.
///
/// This models signed money: subtraction may produce a negative result and
/// parsing accepts negative text. Whether a negative value is acceptable is a
/// business rule checked by the caller, not by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(Decimal);

impl Amount {
  pub const ZERO: Amount = Amount(Decimal::ZERO);

  /// Normalizes a raw decimal to the fixed scale.
  pub fn new(value: Decimal) -> Self {
    let mut normalized = value;
    normalized.rescale(SCALE);
    Amount(normalized)
  }

  /// Parses decimal text into an [`Amount`].
  ///
  /// Rejects non-numeric input, and rejects fractional digits beyond the
  /// fixed scale only when dropping them would lose value (trailing zeros
  /// are accepted). Negative values parse successfully.
  pub fn parse(text: &str) -> Result<Self, ParseAmountError> {
    let trimmed = text.trim();
    let value: Decimal = trimmed
      .parse()
      .map_err(|_| ParseAmountError::Invalid(trimmed.to_string()))?;

    if value.scale() > SCALE && value.normalize().scale() > SCALE {
      return Err(ParseAmountError::TooPrecise(trimmed.to_string()));
    }

    Ok(Amount::new(value))
  }

  pub fn is_negative(&self) -> bool {
    self.0 < Decimal::ZERO
  }

  pub fn is_positive(&self) -> bool {
    self.0 > Decimal::ZERO
  }

  pub fn is_zero(&self) -> bool {
    self.0.is_zero()
  }
}

impl Add for Amount {
  type Output = Amount;

  fn add(self, rhs: Amount) -> Amount {
    Amount::new(self.0 + rhs.0)
  }
}

impl Sub for Amount {
  type Output = Amount;

  fn sub(self, rhs: Amount) -> Amount {
    Amount::new(self.0 - rhs.0)
  }
}

impl fmt::Display for Amount {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:.4}", self.0)
  }
}

impl Serialize for Amount {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for Amount {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let text = String::deserialize(deserializer)?;
    Amount::parse(&text).map_err(serde::de::Error::custom)
  }
}
