//! Scripted collaborators for unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;

use crate::Amount;
use crate::ledger::{LedgerError, LedgerStore, MemoryLedger};
use crate::model::{AccrualObservation, AccrualStatus, OrderStatus};
use crate::scoring::{PollOutcome, Scoring, ScoringError};

type Step = Result<PollOutcome, ScoringError>;

pub(crate) fn observed(order: &str, status: AccrualStatus, accrual: Option<i64>) -> Step {
    Ok(PollOutcome::Observed(AccrualObservation {
        order: order.to_string(),
        status,
        accrual: accrual.map(Amount::from_scaled),
    }))
}

/// Answers each order from its own script; the last step repeats forever.
#[derive(Default)]
pub(crate) struct ScriptedScoring {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    polls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedScoring {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(self, order: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(order.to_string(), steps.into_iter().collect());
        self
    }

    pub(crate) fn polls(&self, order: &str) -> usize {
        self.polls
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o == order)
            .count()
    }

    pub(crate) fn first_poll(&self, order: &str) -> Option<Instant> {
        self.polls
            .lock()
            .unwrap()
            .iter()
            .find(|(o, _)| o == order)
            .map(|(_, at)| *at)
    }
}

#[async_trait]
impl Scoring for ScriptedScoring {
    async fn poll(&self, order: &str) -> Result<PollOutcome, ScoringError> {
        self.polls
            .lock()
            .unwrap()
            .push((order.to_string(), Instant::now()));

        let mut scripts = self.scripts.lock().unwrap();
        let Some(steps) = scripts.get_mut(order) else {
            return Err(ScoringError::UnexpectedStatus(404));
        };
        match steps.len() {
            0 => Err(ScoringError::UnexpectedStatus(404)),
            1 => steps[0].clone(),
            _ => steps.pop_front().unwrap(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LedgerEvent {
    Status(String, OrderStatus),
    Credit(String, Amount),
}

/// [`MemoryLedger`] that also keeps the order of successful writes.
#[derive(Default)]
pub(crate) struct RecordingLedger {
    inner: MemoryLedger,
    events: Mutex<Vec<LedgerEvent>>,
}

impl RecordingLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inner(&self) -> &MemoryLedger {
        &self.inner
    }

    pub(crate) fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerStore for RecordingLedger {
    async fn update_order(
        &self,
        user: &str,
        order: &str,
        status: OrderStatus,
        accrual: Option<Amount>,
    ) -> Result<(), LedgerError> {
        self.inner.update_order(user, order, status, accrual).await?;
        self.events
            .lock()
            .unwrap()
            .push(LedgerEvent::Status(order.to_string(), status));
        Ok(())
    }

    async fn credit_balance(&self, user: &str, delta: Amount) -> Result<(), LedgerError> {
        self.inner.credit_balance(user, delta).await?;
        self.events
            .lock()
            .unwrap()
            .push(LedgerEvent::Credit(user.to_string(), delta));
        Ok(())
    }
}

/// Ledger write a [`FailingLedger`] rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailOn {
    Status,
    Credit,
}

/// [`MemoryLedger`] rejecting every write of one kind with a fixed error.
pub(crate) struct FailingLedger {
    inner: MemoryLedger,
    fail_on: FailOn,
    error: LedgerError,
    credits: AtomicUsize,
}

impl FailingLedger {
    pub(crate) fn new(fail_on: FailOn, error: LedgerError) -> Self {
        Self {
            inner: MemoryLedger::new(),
            fail_on,
            error,
            credits: AtomicUsize::new(0),
        }
    }

    pub(crate) fn inner(&self) -> &MemoryLedger {
        &self.inner
    }

    /// Credits that reached the inner ledger.
    pub(crate) fn credits(&self) -> usize {
        self.credits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for FailingLedger {
    async fn update_order(
        &self,
        user: &str,
        order: &str,
        status: OrderStatus,
        accrual: Option<Amount>,
    ) -> Result<(), LedgerError> {
        if self.fail_on == FailOn::Status {
            return Err(self.error.clone());
        }
        self.inner.update_order(user, order, status, accrual).await
    }

    async fn credit_balance(&self, user: &str, delta: Amount) -> Result<(), LedgerError> {
        if self.fail_on == FailOn::Credit {
            return Err(self.error.clone());
        }
        self.inner.credit_balance(user, delta).await?;
        self.credits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
