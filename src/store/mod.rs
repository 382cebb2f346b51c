//! Storage seam for balance records and the audit log.
//!
//! The [`BalanceStore`] hands out atomic units of work; all reads and writes
//! hang off the unit handle, so no operation can outlive the unit that owns
//! it. The [`memory`] module provides an in-memory implementation with
//! optimistic, version-checked commits.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::disburse::model::{PaymentMethod, PaymentMethodKey, TransactionLog};
use crate::money::Amount;

/// Failures surfaced by the storage layer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
  #[error("no balance record for {0}")]
  NotFound(PaymentMethodKey),

  #[error("balance record for {0} vanished mid-unit")]
  NoSuchRow(PaymentMethodKey),

  #[error("a concurrent unit invalidated this view")]
  Conflict,

  #[error("audit log append failed: {0}")]
  WriteError(String),

  #[error("storage unavailable: {0}")]
  Unavailable(String),
}

/// Durable keyed storage of payment-method balances.
///
/// `begin` starts a strict-serializable unit of work: when two units
/// concurrently touch the same key, one observes [`StoreError::Conflict`]
/// and must retry from scratch while the other completes as if run alone.
#[async_trait]
pub trait BalanceStore: Send + Sync {
  type Unit: StorageUnit + AuditLog;

  async fn begin(&self) -> Result<Self::Unit, StoreError>;
}

/// One atomic unit of work against the balance store.
///
/// Consuming `commit`/`rollback` make it impossible to keep using a unit
/// after it has finished.
#[async_trait]
pub trait StorageUnit: Send {
  /// Reads the current balance for a key within this unit's consistency view.
  async fn read_balance(&mut self, key: &PaymentMethodKey) -> Result<PaymentMethod, StoreError>;

  /// Stages a conditional update of the targeted row. [`StoreError::NoSuchRow`]
  /// means the key disappeared between read and write, which callers must
  /// treat as an integrity violation rather than a silent no-op.
  async fn write_balance(
    &mut self,
    key: &PaymentMethodKey,
    balance: Amount,
  ) -> Result<(), StoreError>;

  /// Commits all staged effects. [`StoreError::Conflict`] means a concurrent
  /// unit won; every staged effect has been discarded and the caller may
  /// retry with a fresh unit.
  async fn commit(self) -> Result<(), StoreError>;

  /// Discards all staged effects. Always safe to call, including after a
  /// partial failure.
  async fn rollback(self);
}

/// Append-only recording of completed disbursements.
///
/// Implemented by the same unit handle as [`StorageUnit`] so the audit row
/// commits or rolls back together with its balance write.
#[async_trait]
pub trait AuditLog: Send {
  async fn append(&mut self, entry: TransactionLog) -> Result<(), StoreError>;
}
