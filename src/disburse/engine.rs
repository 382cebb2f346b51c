use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error, warn};
use thiserror::Error;

use super::model::{DisburseRequest, PaymentMethodKey, TransactionId, TransactionLog};
use crate::cancel::CancelToken;
use crate::money::Amount;
use crate::store::{AuditLog, BalanceStore, StorageUnit, StoreError};

pub type Result<T> = core::result::Result<T, DisburseError>;

/// Possible outcomes of a rejected disbursement.
/// We are dealing with money, so every kind is explicit: the gateway surfaces
/// these to its caller without reinterpretation, and nothing is swallowed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DisburseError {
  /// Malformed, zero, or negative requested amount. Detected before any
  /// storage is touched; never retried.
  #[error("invalid amount: {0}")]
  InvalidAmount(String),

  /// No balance record for the given key. Never retried.
  #[error("payment method not found: {0}")]
  PaymentMethodNotFound(PaymentMethodKey),

  /// The requested amount exceeds the current balance. Terminal business
  /// rejection, never retried.
  #[error("not enough balance for the requested amount")]
  InsufficientFunds,

  /// The conflict-retry budget ran out. The caller may retry later.
  #[error("too contended, retry budget exhausted")]
  ContentionExhausted,

  /// An internal invariant was violated. Indicates a bug or storage
  /// corruption rather than a user error; always fatal.
  #[error("integrity violation: {0}")]
  IntegrityViolation(String),

  /// Underlying storage unreachable. The caller may retry with backoff.
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// The caller cancelled the request before it committed. The unit has
  /// been rolled back.
  #[error("cancelled by the caller")]
  Cancelled,
}

/// Bounded conflict-retry budget with exponential backoff.
///
/// Retrying unboundedly in a tight loop is a livelock hazard under heavy
/// contention, so the budget is capped and exhausting it surfaces as
/// [`DisburseError::ContentionExhausted`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
}

impl RetryPolicy {
  /// Backoff before re-running the attempt numbered `attempt` (zero-based).
  fn delay(&self, attempt: u32) -> Duration {
    self.base_delay * (1u32 << attempt.min(6))
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_millis(10),
    }
  }
}

/// Success output of a disbursement: the committed audit identifier and the
/// balance left on the payment method.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
  pub transaction_id: TransactionId,
  pub new_balance: Amount,
}

enum Outcome {
  Committed(Receipt),
  Conflicted,
}

/// The disbursement engine: executes one debit as an atomic, validated,
/// retryable operation against a [`BalanceStore`].
///
/// The store handle is injected explicitly; the engine holds no ambient
/// state and can be shared across concurrent request tasks behind an `Arc`,
/// since correctness against the same balance key is delegated entirely to
/// the store's atomic-unit guarantee.
#[derive(Debug)]
pub struct Disburser<S> {
  store: S,
  retry: RetryPolicy,
  next_tid: AtomicU64,
}

impl<S> Disburser<S>
where
  S: BalanceStore,
{
  /// Creates an engine over the given store with the default retry policy.
  ///
  /// Transaction identifiers are minted from a counter owned by this engine,
  /// so a store must be served by exactly one engine instance (shared behind
  /// an `Arc` across tasks) for ids to stay unique. A store that assigns its
  /// own identifiers on append lifts that restriction.
  pub fn new(store: S) -> Self {
    Self::with_retry_policy(store, RetryPolicy::default())
  }

  pub fn with_retry_policy(store: S, retry: RetryPolicy) -> Self {
    Self {
      store,
      retry,
      next_tid: AtomicU64::new(1),
    }
  }

  /// Executes one disbursement request.
  ///
  /// The amount is validated before any storage is touched: it must parse as
  /// an exact decimal and be strictly positive. A negative request is
  /// rejected here and not left to the post-subtraction balance check, which
  /// a negative debit would pass while increasing the balance.
  ///
  /// Commit conflicts are retried from scratch with a fresh read, up to the
  /// configured budget; every other failure rolls the unit back and is
  /// surfaced to the caller.
  pub async fn disburse(&self, request: &DisburseRequest, cancel: &CancelToken) -> Result<Receipt> {
    let amount = Amount::parse(&request.amount)
      .map_err(|err| DisburseError::InvalidAmount(err.to_string()))?;

    if !amount.is_positive() {
      return Err(DisburseError::InvalidAmount(format!(
        "amount must be positive: {}",
        amount
      )));
    }

    let key = request.key();

    for attempt in 0..self.retry.max_attempts {
      if cancel.is_cancelled() {
        return Err(DisburseError::Cancelled);
      }

      match self.try_once(&key, amount, cancel).await? {
        Outcome::Committed(receipt) => return Ok(receipt),
        Outcome::Conflicted => {
          debug!(
            "commit conflict on {}, attempt {} of {}",
            key,
            attempt + 1,
            self.retry.max_attempts
          );
          // No point backing off once the budget is spent.
          if attempt + 1 < self.retry.max_attempts {
            tokio::time::sleep(self.retry.delay(attempt)).await;
          }
        }
      }
    }

    warn!(
      "retry budget exhausted after {} attempts on {}",
      self.retry.max_attempts, key
    );
    Err(DisburseError::ContentionExhausted)
  }

  /// One attempt of steps begin..commit. A `Conflicted` outcome means every
  /// staged effect has been discarded and the caller may retry; no state from
  /// this attempt is reused, since a stale read would reintroduce a
  /// lost-update bug.
  async fn try_once(
    &self,
    key: &PaymentMethodKey,
    amount: Amount,
    cancel: &CancelToken,
  ) -> Result<Outcome> {
    let mut unit = match self.store.begin().await {
      Ok(unit) => unit,
      Err(StoreError::Conflict) => return Ok(Outcome::Conflicted),
      Err(err) => return Err(internal_failure(err)),
    };

    let method = match unit.read_balance(key).await {
      Ok(method) => method,
      Err(err) => {
        unit.rollback().await;
        return match err {
          StoreError::NotFound(key) => Err(DisburseError::PaymentMethodNotFound(key)),
          StoreError::Conflict => Ok(Outcome::Conflicted),
          other => Err(internal_failure(other)),
        };
      }
    };

    let new_balance = method.balance - amount;
    if new_balance.is_negative() {
      unit.rollback().await;
      return Err(DisburseError::InsufficientFunds);
    }

    if cancel.is_cancelled() {
      unit.rollback().await;
      return Err(DisburseError::Cancelled);
    }

    if let Err(err) = unit.write_balance(key, new_balance).await {
      unit.rollback().await;
      return match err {
        StoreError::NoSuchRow(key) => {
          error!("balance record {} vanished mid-unit", key);
          Err(DisburseError::IntegrityViolation(format!(
            "balance record {} vanished mid-unit",
            key
          )))
        }
        StoreError::Conflict => Ok(Outcome::Conflicted),
        other => Err(internal_failure(other)),
      };
    }

    let transaction_id = self.next_tid.fetch_add(1, Ordering::Relaxed);
    let entry = TransactionLog {
      tid: transaction_id,
      user_id: key.user_id.clone(),
      method_type: key.method_type,
      currency: key.currency,
      checkout_amount: amount,
    };

    // An append failure aborts the whole unit: the balance must never be
    // mutated without its audit record.
    if let Err(err) = unit.append(entry).await {
      unit.rollback().await;
      return match err {
        StoreError::Conflict => Ok(Outcome::Conflicted),
        other => Err(internal_failure(other)),
      };
    }

    if cancel.is_cancelled() {
      unit.rollback().await;
      return Err(DisburseError::Cancelled);
    }

    match unit.commit().await {
      Ok(()) => Ok(Outcome::Committed(Receipt {
        transaction_id,
        new_balance,
      })),
      Err(StoreError::Conflict) => Ok(Outcome::Conflicted),
      Err(err) => Err(internal_failure(err)),
    }
  }
}

/// Maps non-retryable storage failures onto the caller-visible taxonomy.
/// Anything unexpected is treated as an integrity violation rather than
/// retried, since retrying an unknown fault risks duplicate side effects.
fn internal_failure(err: StoreError) -> DisburseError {
  match err {
    StoreError::Unavailable(reason) => DisburseError::StorageUnavailable(reason),
    StoreError::WriteError(reason) => DisburseError::StorageUnavailable(reason),
    other => DisburseError::IntegrityViolation(other.to_string()),
  }
}

#[cfg(test)]
mod tests {

  use std::sync::atomic::AtomicU32;
  use std::sync::Arc;

  use async_trait::async_trait;
  use rust_decimal_macros::dec;

  use super::*;
  use crate::cancel::cancel_pair;
  use crate::disburse::model::{Currency, MethodType, PaymentMethod, User};
  use crate::store::memory::{InMemoryStore, InMemoryUnit};

  const USER: &str = "mock_user";

  fn request(amount: &str) -> DisburseRequest {
    DisburseRequest {
      user_id: USER.to_string(),
      currency: Currency::Idr,
      method_type: MethodType::Default,
      amount: amount.to_string(),
    }
  }

  fn key() -> PaymentMethodKey {
    PaymentMethodKey::new(USER, Currency::Idr, MethodType::Default)
  }

  async fn provisioned_store(balance: &str) -> InMemoryStore {
    let store = InMemoryStore::new();
    store.add_user(User::new(USER)).await.unwrap();
    store
      .add_payment_method(key(), Amount::parse(balance).unwrap())
      .await
      .unwrap();
    store
  }

  async fn assert_untouched(store: &InMemoryStore, balance: &str) {
    assert_eq!(
      store.balance(&key()).await,
      Some(Amount::parse(balance).unwrap())
    );
    assert!(store.transaction_logs().await.is_empty());
  }

  #[tokio::test]
  async fn disburse_rejects_malformed_amount() {
    let store = provisioned_store("100").await;
    let engine = Disburser::new(store.clone());

    for text in &["", "abc", "1.2.3", "0.00001"] {
      let result = engine.disburse(&request(text), &CancelToken::never()).await;

      assert!(matches!(result, Err(DisburseError::InvalidAmount(_))));
    }

    assert_untouched(&store, "100").await;
  }

  #[tokio::test]
  async fn disburse_rejects_zero_amount() {
    let store = provisioned_store("100").await;
    let engine = Disburser::new(store.clone());

    let result = engine.disburse(&request("0"), &CancelToken::never()).await;

    assert!(matches!(result, Err(DisburseError::InvalidAmount(_))));
    assert_untouched(&store, "100").await;
  }

  #[tokio::test]
  async fn disburse_rejects_negative_amount() {
    let store = provisioned_store("100").await;
    let engine = Disburser::new(store.clone());

    // A negative debit would pass the post-subtraction balance check while
    // increasing the balance, so it must be rejected up front.
    let result = engine
      .disburse(&request("-1.00"), &CancelToken::never())
      .await;

    assert!(matches!(result, Err(DisburseError::InvalidAmount(_))));
    assert_untouched(&store, "100").await;
  }

  #[tokio::test]
  async fn disburse_unknown_payment_method() {
    let store = InMemoryStore::new();
    let engine = Disburser::new(store.clone());

    let result = engine.disburse(&request("10"), &CancelToken::never()).await;

    assert_eq!(result, Err(DisburseError::PaymentMethodNotFound(key())));
    assert!(store.transaction_logs().await.is_empty());
  }

  #[tokio::test]
  async fn disburse_insufficient_funds_leaves_state_unchanged() {
    let store = provisioned_store("10").await;
    let engine = Disburser::new(store.clone());

    let result = engine
      .disburse(&request("10.0001"), &CancelToken::never())
      .await;

    assert_eq!(result, Err(DisburseError::InsufficientFunds));
    assert_untouched(&store, "10").await;
  }

  #[tokio::test]
  async fn disburse_successfully() {
    let store = provisioned_store("100").await;
    let engine = Disburser::new(store.clone());

    let receipt = engine
      .disburse(&request("30"), &CancelToken::never())
      .await
      .unwrap();

    assert_eq!(receipt.new_balance, Amount::new(dec!(70)));
    assert_eq!(store.balance(&key()).await, Some(Amount::new(dec!(70))));

    let logs = store.transaction_logs().await;
    assert_eq!(
      logs,
      vec![TransactionLog {
        tid: receipt.transaction_id,
        user_id: USER.to_string(),
        method_type: MethodType::Default,
        currency: Currency::Idr,
        checkout_amount: Amount::new(dec!(30)),
      }]
    );
  }

  #[tokio::test]
  async fn disburse_allows_draining_to_exactly_zero() {
    let store = provisioned_store("10").await;
    let engine = Disburser::new(store.clone());

    let receipt = engine
      .disburse(&request("10"), &CancelToken::never())
      .await
      .unwrap();

    assert_eq!(receipt.new_balance, Amount::ZERO);
    assert_eq!(store.balance(&key()).await, Some(Amount::ZERO));
  }

  #[tokio::test]
  async fn sequential_disbursements_conserve_value() {
    let store = provisioned_store("10000").await;
    let engine = Disburser::new(store.clone());

    for _ in 0..40 {
      engine
        .disburse(&request("250"), &CancelToken::never())
        .await
        .unwrap();
    }

    assert_eq!(store.balance(&key()).await, Some(Amount::ZERO));

    let logs = store.transaction_logs().await;
    assert_eq!(logs.len(), 40);
    assert!(logs
      .iter()
      .all(|log| log.checkout_amount == Amount::new(dec!(250))));

    // Audit identifiers are unique and monotonic.
    assert!(logs.windows(2).all(|pair| pair[0].tid < pair[1].tid));
  }

  #[tokio::test]
  async fn disbursements_are_decimal_exact() {
    let store = provisioned_store("1.00").await;
    let engine = Disburser::new(store.clone());

    for amount in &["0.33", "0.33", "0.34"] {
      engine
        .disburse(&request(amount), &CancelToken::never())
        .await
        .unwrap();
    }

    // No binary floating-point residue: exactly zero remains.
    assert_eq!(store.balance(&key()).await, Some(Amount::ZERO));

    let result = engine
      .disburse(&request("0.0001"), &CancelToken::never())
      .await;
    assert_eq!(result, Err(DisburseError::InsufficientFunds));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_disbursements_drain_balance_exactly() {
    const TASKS: usize = 8;

    let store = provisioned_store("1000").await;
    let engine = Arc::new(Disburser::with_retry_policy(
      store.clone(),
      RetryPolicy {
        max_attempts: 100,
        base_delay: Duration::from_millis(1),
      },
    ));

    let handles: Vec<_> = (0..TASKS)
      .map(|_| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.disburse(&request("125"), &CancelToken::never()).await })
      })
      .collect();

    for handle in handles {
      assert!(handle.await.unwrap().is_ok());
    }

    // N concurrent debits of A against a balance of N*A: all succeed, the
    // final balance is exactly zero, and each debit left one audit row.
    assert_eq!(store.balance(&key()).await, Some(Amount::ZERO));
    assert_eq!(store.transaction_logs().await.len(), TASKS);
  }

  #[tokio::test]
  async fn disburse_retries_conflicts_then_succeeds() {
    let store = provisioned_store("100").await;
    let engine = Disburser::with_retry_policy(
      ConflictingStore::new(store.clone(), 2),
      RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::ZERO,
      },
    );

    let receipt = engine
      .disburse(&request("40"), &CancelToken::never())
      .await
      .unwrap();

    assert_eq!(receipt.new_balance, Amount::new(dec!(60)));
    assert_eq!(store.balance(&key()).await, Some(Amount::new(dec!(60))));
    assert_eq!(store.transaction_logs().await.len(), 1);
  }

  #[tokio::test]
  async fn disburse_surfaces_contention_exhausted() {
    let store = provisioned_store("100").await;
    let engine = Disburser::with_retry_policy(
      ConflictingStore::new(store.clone(), u32::MAX),
      RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::ZERO,
      },
    );

    let result = engine.disburse(&request("40"), &CancelToken::never()).await;

    assert_eq!(result, Err(DisburseError::ContentionExhausted));
    assert_untouched(&store, "100").await;
  }

  #[tokio::test]
  async fn exhaustion_skips_the_backoff_after_the_last_attempt() {
    let store = provisioned_store("100").await;
    let engine = Disburser::with_retry_policy(
      ConflictingStore::new(store.clone(), u32::MAX),
      RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_secs(5),
      },
    );

    let started = std::time::Instant::now();
    let result = engine.disburse(&request("40"), &CancelToken::never()).await;

    assert_eq!(result, Err(DisburseError::ContentionExhausted));
    assert!(started.elapsed() < Duration::from_secs(1));
  }

  #[tokio::test]
  async fn disburse_cancelled_before_commit() {
    let store = provisioned_store("100").await;
    let engine = Disburser::new(store.clone());
    let (handle, token) = cancel_pair();

    handle.cancel();
    let result = engine.disburse(&request("40"), &token).await;

    assert_eq!(result, Err(DisburseError::Cancelled));
    assert_untouched(&store, "100").await;
  }

  #[tokio::test]
  async fn disburse_surfaces_integrity_violation_on_vanished_row() {
    let store = provisioned_store("100").await;
    let engine = Disburser::new(VanishingStore(store.clone()));

    let result = engine.disburse(&request("40"), &CancelToken::never()).await;

    assert!(matches!(result, Err(DisburseError::IntegrityViolation(_))));
    assert_untouched(&store, "100").await;
  }

  #[tokio::test]
  async fn disburse_surfaces_storage_unavailable() {
    let engine = Disburser::new(UnavailableStore);

    let result = engine.disburse(&request("40"), &CancelToken::never()).await;

    assert!(matches!(result, Err(DisburseError::StorageUnavailable(_))));
  }

  #[tokio::test]
  async fn validation_failures_never_touch_storage() {
    let engine = Disburser::new(UnavailableStore);

    // Storage is unreachable, but parse-level rejections happen before any
    // unit is begun, so they still come back as InvalidAmount.
    let result = engine
      .disburse(&request("not-a-number"), &CancelToken::never())
      .await;

    assert!(matches!(result, Err(DisburseError::InvalidAmount(_))));
  }

  /// Store wrapper that fails the next `remaining` commits with a conflict.
  struct ConflictingStore {
    inner: InMemoryStore,
    remaining: Arc<AtomicU32>,
  }

  impl ConflictingStore {
    fn new(inner: InMemoryStore, conflicts: u32) -> Self {
      Self {
        inner,
        remaining: Arc::new(AtomicU32::new(conflicts)),
      }
    }
  }

  #[async_trait]
  impl BalanceStore for ConflictingStore {
    type Unit = ConflictingUnit;

    async fn begin(&self) -> core::result::Result<ConflictingUnit, StoreError> {
      Ok(ConflictingUnit {
        inner: self.inner.begin().await?,
        remaining: Arc::clone(&self.remaining),
      })
    }
  }

  struct ConflictingUnit {
    inner: InMemoryUnit,
    remaining: Arc<AtomicU32>,
  }

  #[async_trait]
  impl StorageUnit for ConflictingUnit {
    async fn read_balance(
      &mut self,
      key: &PaymentMethodKey,
    ) -> core::result::Result<PaymentMethod, StoreError> {
      self.inner.read_balance(key).await
    }

    async fn write_balance(
      &mut self,
      key: &PaymentMethodKey,
      balance: Amount,
    ) -> core::result::Result<(), StoreError> {
      self.inner.write_balance(key, balance).await
    }

    async fn commit(self) -> core::result::Result<(), StoreError> {
      let conflicted = self
        .remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();

      if conflicted {
        self.inner.rollback().await;
        Err(StoreError::Conflict)
      } else {
        self.inner.commit().await
      }
    }

    async fn rollback(self) {
      self.inner.rollback().await;
    }
  }

  #[async_trait]
  impl AuditLog for ConflictingUnit {
    async fn append(&mut self, entry: TransactionLog) -> core::result::Result<(), StoreError> {
      self.inner.append(entry).await
    }
  }

  /// Store wrapper whose rows "vanish" between read and write.
  struct VanishingStore(InMemoryStore);

  #[async_trait]
  impl BalanceStore for VanishingStore {
    type Unit = VanishingUnit;

    async fn begin(&self) -> core::result::Result<VanishingUnit, StoreError> {
      Ok(VanishingUnit(self.0.begin().await?))
    }
  }

  struct VanishingUnit(InMemoryUnit);

  #[async_trait]
  impl StorageUnit for VanishingUnit {
    async fn read_balance(
      &mut self,
      key: &PaymentMethodKey,
    ) -> core::result::Result<PaymentMethod, StoreError> {
      self.0.read_balance(key).await
    }

    async fn write_balance(
      &mut self,
      key: &PaymentMethodKey,
      _balance: Amount,
    ) -> core::result::Result<(), StoreError> {
      Err(StoreError::NoSuchRow(key.clone()))
    }

    async fn commit(self) -> core::result::Result<(), StoreError> {
      self.0.commit().await
    }

    async fn rollback(self) {
      self.0.rollback().await;
    }
  }

  #[async_trait]
  impl AuditLog for VanishingUnit {
    async fn append(&mut self, entry: TransactionLog) -> core::result::Result<(), StoreError> {
      self.0.append(entry).await
    }
  }

  /// Store whose units can never be begun.
  struct UnavailableStore;

  #[async_trait]
  impl BalanceStore for UnavailableStore {
    type Unit = InMemoryUnit;

    async fn begin(&self) -> core::result::Result<InMemoryUnit, StoreError> {
      Err(StoreError::Unavailable("connection refused".to_string()))
    }
  }
}
