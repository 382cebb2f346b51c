//! Balance-disbursement engine: atomically debits a payment-method balance
//! and appends an immutable audit row, or rejects the request entirely.
//!
//! The [`disburse`] module holds the domain logic, the [`store`] module the
//! storage seam (with an in-memory implementation in [`store::memory`]), the
//! [`money`] module the exact decimal value type, and [`cancel`] the
//! cancellation signal a gateway can attach to a request.
//!
//! The transport in front of the engine is a collaborator, not part of this
//! crate: it supplies an authenticated user identity and the raw amount text,
//! and surfaces [`DisburseError`] kinds to its caller without
//! reinterpretation.

pub mod cancel;
pub mod disburse;
pub mod money;
pub mod store;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use disburse::{
  Currency, DisburseError, DisburseRequest, Disburser, MethodType, PaymentMethod,
  PaymentMethodKey, Receipt, RetryPolicy, TransactionId, TransactionLog, User,
};
pub use money::{Amount, ParseAmountError};
pub use store::{memory::InMemoryStore, AuditLog, BalanceStore, StorageUnit, StoreError};
