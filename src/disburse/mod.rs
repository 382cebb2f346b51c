//! This module contains the domain logic to execute disbursements
//!
//! The [`Disburser`] validates a request, debits the balance record inside one
//! atomic unit of the injected [`crate::store::BalanceStore`], appends the
//! audit row in the same unit, and retries on commit conflicts.
//

pub mod engine;
pub mod model;

pub use engine::{DisburseError, Disburser, Receipt, RetryPolicy};
pub use model::{
  Currency, DisburseRequest, MethodType, PaymentMethod, PaymentMethodKey, TransactionId,
  TransactionLog, User,
};
