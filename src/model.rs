//! Core domain types shared by the scoring client, the ledger and the workers.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;

use crate::Amount;

/// Order status as reported by the external scoring service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    /// Known to the scoring service, not yet being scored.
    Registered,
    /// Being scored.
    Processing,
    /// Rejected, no points will be awarded.
    Invalid,
    /// Scored, the accrual amount is final.
    Processed,
    /// Anything the service sends that we do not recognize, or no status at all.
    #[default]
    #[serde(other)]
    Unknown,
}

impl AccrualStatus {
    /// Map the external vocabulary onto the ledger's.
    ///
    /// `REGISTERED` collapses into `PROCESSING`; unknown statuses have no ledger
    /// counterpart and are never written.
    pub fn to_order_status(self) -> Option<OrderStatus> {
        match self {
            AccrualStatus::Registered | AccrualStatus::Processing => Some(OrderStatus::Processing),
            AccrualStatus::Invalid => Some(OrderStatus::Invalid),
            AccrualStatus::Processed => Some(OrderStatus::Processed),
            AccrualStatus::Unknown => None,
        }
    }
}

/// One answer from the scoring service for one order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccrualObservation {
    pub order: String,
    #[serde(default)]
    pub status: AccrualStatus,
    /// Present only once a credit amount is known.
    #[serde(default)]
    pub accrual: Option<Amount>,
}

/// Order status as stored in the ledger.
///
/// Transitions only move forward: `New` -> `Processing` -> one of the terminal
/// states. `Invalid` and `Processed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderStatus {
    #[default]
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    /// Position in the forward-only lifecycle.
    pub fn rank(self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::Processing => 1,
            OrderStatus::Invalid | OrderStatus::Processed => 2,
        }
    }

    /// Whether a record currently in `self` may be moved to `next`.
    pub fn can_advance_to(self, next: OrderStatus) -> bool {
        self == next || (!self.is_terminal() && next.rank() > self.rank())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded order as the ledger stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub number: String,
    pub user: String,
    pub status: OrderStatus,
    pub accrual: Option<Amount>,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// A freshly uploaded order in the `New` state.
    pub fn new(number: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            user: user.into(),
            status: OrderStatus::New,
            accrual: None,
            uploaded_at: Utc::now(),
        }
    }
}

/// A user's points balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    pub current: Amount,
    pub withdrawn: Amount,
}

/// Order numbers are non-empty strings of ASCII digits.
pub fn is_order_number(number: &str) -> bool {
    !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit())
}
