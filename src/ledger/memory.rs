use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{LedgerError, LedgerStore};
use crate::Amount;
use crate::model::{Balance, Order, OrderStatus};

#[derive(Debug, Default)]
struct LedgerState {
    /// Orders keyed by number; numbers are unique across users.
    orders: HashMap<String, Order>,
    balances: HashMap<String, Balance>,
}

/// In-memory [`LedgerStore`].
///
/// Every operation takes the state lock once, so each call is atomic on its
/// own. Status writes that would move an order backwards are rejected.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly uploaded order as `NEW` and open the user's balance.
    pub async fn register_order(&self, user: &str, number: &str) -> Result<Order, LedgerError> {
        let mut state = self.state.write().await;
        if state.orders.contains_key(number) {
            return Err(LedgerError::DuplicateOrder(number.to_string()));
        }

        let order = Order::new(number, user);
        state.orders.insert(number.to_string(), order.clone());
        state.balances.entry(user.to_string()).or_default();
        Ok(order)
    }

    pub async fn order(&self, number: &str) -> Option<Order> {
        self.state.read().await.orders.get(number).cloned()
    }

    /// Orders of one user, oldest upload first.
    pub async fn orders_for(&self, user: &str) -> Vec<Order> {
        let state = self.state.read().await;
        let mut orders: Vec<_> = state
            .orders
            .values()
            .filter(|o| o.user == user)
            .cloned()
            .collect();
        orders.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| a.number.cmp(&b.number))
        });
        orders
    }

    /// All orders, sorted by user then number.
    pub async fn orders(&self) -> Vec<Order> {
        let state = self.state.read().await;
        let mut orders: Vec<_> = state.orders.values().cloned().collect();
        orders.sort_by(|a, b| a.user.cmp(&b.user).then_with(|| a.number.cmp(&b.number)));
        orders
    }

    /// Balance of one user; users without a balance record have a zero balance.
    pub async fn balance(&self, user: &str) -> Balance {
        self.state
            .read()
            .await
            .balances
            .get(user)
            .copied()
            .unwrap_or_default()
    }

    /// All balances, sorted by user.
    pub async fn balances(&self) -> Vec<(String, Balance)> {
        let state = self.state.read().await;
        let mut balances: Vec<_> = state
            .balances
            .iter()
            .map(|(user, balance)| (user.clone(), *balance))
            .collect();
        balances.sort_by(|a, b| a.0.cmp(&b.0));
        balances
    }

    /// Move `sum` from the user's current balance to the withdrawn total.
    ///
    /// Keeps `current >= 0`.
    pub async fn withdraw(&self, user: &str, sum: Amount) -> Result<Balance, LedgerError> {
        if sum.is_negative() {
            return Err(LedgerError::NegativeAmount(sum));
        }

        let mut state = self.state.write().await;
        let balance = state.balances.entry(user.to_string()).or_default();
        if balance.current < sum {
            return Err(LedgerError::InsufficientFunds(
                user.to_string(),
                balance.current,
                sum,
            ));
        }

        let (Some(current), Some(withdrawn)) = (
            balance.current.checked_sub(sum),
            balance.withdrawn.checked_add(sum),
        ) else {
            return Err(LedgerError::Overflow(user.to_string()));
        };
        balance.current = current;
        balance.withdrawn = withdrawn;
        info!(user, sum = %sum, current = %balance.current, "withdrawal applied");
        Ok(*balance)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn update_order(
        &self,
        user: &str,
        order: &str,
        status: OrderStatus,
        accrual: Option<Amount>,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.write().await;
        let record = state
            .orders
            .get_mut(order)
            .filter(|o| o.user == user)
            .ok_or_else(|| LedgerError::OrderNotFound(order.to_string(), user.to_string()))?;

        if !record.status.can_advance_to(status) {
            return Err(LedgerError::StatusRegression {
                order: order.to_string(),
                from: record.status,
                to: status,
            });
        }

        record.status = status;
        if accrual.is_some() {
            record.accrual = accrual;
        }
        debug!(order, user, %status, "order updated");
        Ok(())
    }

    async fn credit_balance(&self, user: &str, delta: Amount) -> Result<(), LedgerError> {
        if delta.is_negative() {
            return Err(LedgerError::NegativeAmount(delta));
        }

        let mut state = self.state.write().await;
        let balance = state.balances.entry(user.to_string()).or_default();
        balance.current = balance
            .current
            .checked_add(delta)
            .ok_or_else(|| LedgerError::Overflow(user.to_string()))?;
        debug!(user, delta = %delta, current = %balance.current, "balance credited");
        Ok(())
    }
}
