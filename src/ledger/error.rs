//! Error types for ledger writes.

use thiserror::Error;

use crate::Amount;
use crate::model::OrderStatus;

/// Error returned by a [`LedgerStore`](super::LedgerStore) operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("order {0} not found for user {1}")]
    OrderNotFound(String, String),

    #[error("order {0} already uploaded")]
    DuplicateOrder(String),

    #[error("order {order}: refusing to move status from {from} to {to}")]
    StatusRegression {
        order: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("insufficient funds for user {0}: current {1}, requested {2}")]
    InsufficientFunds(String, Amount, Amount),

    #[error("amount {0} must not be negative")]
    NegativeAmount(Amount),

    #[error("balance of user {0} would overflow")]
    Overflow(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}
