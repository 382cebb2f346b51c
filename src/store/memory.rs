use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AuditLog, BalanceStore, StorageUnit, StoreError};
use crate::disburse::model::{PaymentMethod, PaymentMethodKey, TransactionLog, User};
use crate::money::Amount;

/// In-memory [`BalanceStore`] with optimistic concurrency control.
///
/// Every row carries a version. A unit records the version of each row it
/// touches and stages its writes and audit appends in buffers; `commit`
/// re-checks the recorded versions under one lock and applies everything, or
/// fails with [`StoreError::Conflict`] if any touched row moved on
/// (first committer wins). For the engine's read-then-write access pattern
/// this is equivalent to strict serializability.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
  state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
  users: HashSet<String>,
  rows: HashMap<PaymentMethodKey, Row>,
  logs: Vec<TransactionLog>,
}

#[derive(Debug)]
struct Row {
  balance: Amount,
  version: u64,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Provisions a user. Usernames are unique.
  pub async fn add_user(&self, user: User) -> Result<(), StoreError> {
    let mut state = self.state.lock().await;
    if !state.users.insert(user.username.clone()) {
      return Err(StoreError::WriteError(format!(
        "user already exists: {}",
        user.username
      )));
    }
    Ok(())
  }

  /// Provisions a balance record. The referenced user must already exist and
  /// the key must not be taken.
  pub async fn add_payment_method(
    &self,
    key: PaymentMethodKey,
    balance: Amount,
  ) -> Result<(), StoreError> {
    let mut state = self.state.lock().await;
    if !state.users.contains(&key.user_id) {
      return Err(StoreError::WriteError(format!(
        "no such user: {}",
        key.user_id
      )));
    }
    if state.rows.contains_key(&key) {
      return Err(StoreError::WriteError(format!(
        "payment method already exists: {}",
        key
      )));
    }
    state.rows.insert(key, Row {
      balance,
      version: 0,
    });
    Ok(())
  }

  /// Current committed balance for a key, if provisioned.
  pub async fn balance(&self, key: &PaymentMethodKey) -> Option<Amount> {
    let state = self.state.lock().await;
    state.rows.get(key).map(|row| row.balance)
  }

  /// All committed audit rows, in commit order.
  pub async fn transaction_logs(&self) -> Vec<TransactionLog> {
    let state = self.state.lock().await;
    state.logs.clone()
  }
}

#[async_trait]
impl BalanceStore for InMemoryStore {
  type Unit = InMemoryUnit;

  async fn begin(&self) -> Result<InMemoryUnit, StoreError> {
    Ok(InMemoryUnit {
      state: Arc::clone(&self.state),
      reads: HashMap::new(),
      writes: HashMap::new(),
      appends: Vec::new(),
    })
  }
}

/// One optimistic unit of work against an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryUnit {
  state: Arc<Mutex<State>>,
  /// Version of each row first observed by this unit.
  reads: HashMap<PaymentMethodKey, u64>,
  writes: HashMap<PaymentMethodKey, Amount>,
  appends: Vec<TransactionLog>,
}

#[async_trait]
impl StorageUnit for InMemoryUnit {
  async fn read_balance(&mut self, key: &PaymentMethodKey) -> Result<PaymentMethod, StoreError> {
    let state = self.state.lock().await;
    let row = state
      .rows
      .get(key)
      .ok_or_else(|| StoreError::NotFound(key.clone()))?;

    self.reads.entry(key.clone()).or_insert(row.version);

    // Read-your-writes: a balance staged by this unit shadows the row.
    let balance = self.writes.get(key).copied().unwrap_or(row.balance);
    Ok(PaymentMethod {
      key: key.clone(),
      balance,
    })
  }

  async fn write_balance(
    &mut self,
    key: &PaymentMethodKey,
    balance: Amount,
  ) -> Result<(), StoreError> {
    let state = self.state.lock().await;
    let row = state
      .rows
      .get(key)
      .ok_or_else(|| StoreError::NoSuchRow(key.clone()))?;

    self.reads.entry(key.clone()).or_insert(row.version);
    self.writes.insert(key.clone(), balance);
    Ok(())
  }

  async fn commit(self) -> Result<(), StoreError> {
    let mut state = self.state.lock().await;

    for (key, version) in &self.reads {
      match state.rows.get(key) {
        Some(row) if row.version == *version => {}
        _ => return Err(StoreError::Conflict),
      }
    }

    for (key, balance) in self.writes {
      // The version check above guarantees the row is still present.
      if let Some(row) = state.rows.get_mut(&key) {
        row.balance = balance;
        row.version += 1;
      }
    }
    state.logs.extend(self.appends);

    Ok(())
  }

  async fn rollback(self) {
    // Effects are only buffers owned by the unit; dropping them is the rollback.
  }
}

#[async_trait]
impl AuditLog for InMemoryUnit {
  async fn append(&mut self, entry: TransactionLog) -> Result<(), StoreError> {
    self.appends.push(entry);
    Ok(())
  }
}
