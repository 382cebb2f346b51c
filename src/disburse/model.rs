use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::money::Amount;

/// Alias for a transaction log identifier
pub type TransactionId = u64;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("unknown persisted value: {0}")]
pub struct UnknownVariant(String);

/// Currencies a payment method can be denominated in.
///
/// Persisted storage keeps these as strings; the enum closes the set at the
/// application boundary so a typo cannot create a phantom balance key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
  Idr,
  Us,
}

impl Currency {
  pub fn as_str(&self) -> &'static str {
    match self {
      Currency::Idr => "Idr",
      Currency::Us => "Us",
    }
  }
}

impl FromStr for Currency {
  type Err = UnknownVariant;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "Idr" => Ok(Currency::Idr),
      "Us" => Ok(Currency::Us),
      other => Err(UnknownVariant(other.to_string())),
    }
  }
}

impl fmt::Display for Currency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Kinds of payment methods a user can hold per currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodType {
  Default,
}

impl MethodType {
  pub fn as_str(&self) -> &'static str {
    match self {
      MethodType::Default => "Default",
    }
  }
}

impl FromStr for MethodType {
  type Err = UnknownVariant;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "Default" => Ok(MethodType::Default),
      other => Err(UnknownVariant(other.to_string())),
    }
  }
}

impl fmt::Display for MethodType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Provisioning-time identity. Immutable once created; payment methods and
/// transaction logs reference it by username.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct User {
  pub username: String,
}

impl User {
  pub fn new(username: impl Into<String>) -> Self {
    Self {
      username: username.into(),
    }
  }
}

/// Composite key identifying one balance record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PaymentMethodKey {
  pub user_id: String,
  pub currency: Currency,
  pub method_type: MethodType,
}

impl PaymentMethodKey {
  pub fn new(user_id: impl Into<String>, currency: Currency, method_type: MethodType) -> Self {
    Self {
      user_id: user_id.into(),
      currency,
      method_type,
    }
  }
}

impl fmt::Display for PaymentMethodKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.user_id, self.currency, self.method_type)
  }
}

/// A balance record as read within an atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentMethod {
  pub key: PaymentMethodKey,
  pub balance: Amount,
}

/// Immutable audit row, created exactly once per committed disbursement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLog {
  pub tid: TransactionId,
  pub user_id: String,
  pub method_type: MethodType,
  pub currency: Currency,
  pub checkout_amount: Amount,
}

/// A disbursement request as forwarded by the gateway.
///
/// The amount is the raw text exactly as received; parsing it is the
/// engine's responsibility, not the gateway's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisburseRequest {
  pub user_id: String,
  pub currency: Currency,
  pub method_type: MethodType,
  pub amount: String,
}

impl DisburseRequest {
  pub fn key(&self) -> PaymentMethodKey {
    PaymentMethodKey::new(self.user_id.clone(), self.currency, self.method_type)
  }
}
