//! Jobs and their cancellation handles.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a job's cancellation handle fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The job's timeout budget ran out.
    Deadline,
    /// Someone called [`CancelHandle::cancel`].
    Aborted,
}

/// Shared cancellation handle of one job.
///
/// Fires either when [`cancel`](Self::cancel) is called on any clone or when
/// the deadline fixed at creation passes.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    aborted: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
}

impl CancelHandle {
    /// A handle that only fires when cancelled explicitly.
    pub fn new() -> Self {
        let (aborted, _) = watch::channel(false);
        Self {
            aborted: Arc::new(aborted),
            deadline: None,
        }
    }

    /// A handle that also fires `budget` from now.
    pub fn with_timeout(budget: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + budget),
            ..Self::new()
        }
    }

    pub fn cancel(&self) {
        self.aborted.send_replace(true);
    }

    /// Time left until the deadline, if the handle has one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Non-blocking check.
    pub fn reason(&self) -> Option<CancelReason> {
        if *self.aborted.borrow() {
            Some(CancelReason::Aborted)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(CancelReason::Deadline)
        } else {
            None
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the handle fires.
    pub async fn cancelled(&self) -> CancelReason {
        let mut aborted = self.aborted.subscribe();
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = aborted.wait_for(|aborted| *aborted) => CancelReason::Aborted,
            _ = deadline => CancelReason::Deadline,
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One order awaiting reconciliation.
#[derive(Debug, Clone)]
pub struct Job {
    pub order: String,
    pub user: String,
    pub cancel: CancelHandle,
}

impl Job {
    pub fn new(order: impl Into<String>, user: impl Into<String>, cancel: CancelHandle) -> Self {
        Self {
            order: order.into(),
            user: user.into(),
            cancel,
        }
    }
}
