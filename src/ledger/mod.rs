//! The ledger capability the reconciliation core writes through.
//!
//! The core never opens transactions itself. It issues independent calls and
//! relies on the store for per-row integrity; the two-step terminal commit is
//! serialized by the dispatcher's commit lock instead.

use async_trait::async_trait;

use crate::Amount;
use crate::model::OrderStatus;

mod error;
pub use error::LedgerError;

mod memory;
pub use memory::MemoryLedger;

/// Order-status and balance writes, callable concurrently from many workers.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Record the latest known status (and accrual, once known) of `order`.
    async fn update_order(
        &self,
        user: &str,
        order: &str,
        status: OrderStatus,
        accrual: Option<Amount>,
    ) -> Result<(), LedgerError>;

    /// Add `delta` to the user's current balance.
    async fn credit_balance(&self, user: &str, delta: Amount) -> Result<(), LedgerError>;
}
