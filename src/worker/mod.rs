//! Per-job reconciliation loop.
//!
//! A worker polls the scoring service for one order until it reports a
//! terminal status, writing intermediate statuses through the ledger as they
//! are observed. The terminal status and the balance credit are committed
//! together under the commit lock shared by all workers, so no reader can see
//! a `PROCESSED` order whose credit has been interleaved with another commit
//! for the same user.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Amount;
use crate::job::Job;
use crate::ledger::LedgerStore;
use crate::model::OrderStatus;
use crate::scoring::{PollOutcome, Scoring};

mod state;
pub use state::{Backoff, WorkerState};

mod error;
pub use error::{JobError, JobOutcome};

/// Tunables shared by every worker a dispatcher spawns.
#[derive(Debug, Clone, Default)]
pub struct WorkerSettings {
    /// Delay schedule after a 429.
    pub backoff: Backoff,
    /// Pause between polls that did not reach a terminal status.
    pub poll_interval: Duration,
}

/// Drives one [`Job`] to a terminal ledger state.
pub struct ReconciliationWorker {
    job: Job,
    scoring: Arc<dyn Scoring>,
    ledger: Arc<dyn LedgerStore>,
    commit_lock: Arc<Mutex<()>>,
    backoff: Backoff,
    poll_interval: Duration,
    /// Highest status this worker has written so far.
    committed: OrderStatus,
}

/// Public API
impl ReconciliationWorker {
    pub fn new(
        job: Job,
        scoring: Arc<dyn Scoring>,
        ledger: Arc<dyn LedgerStore>,
        commit_lock: Arc<Mutex<()>>,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            job,
            scoring,
            ledger,
            commit_lock,
            backoff: settings.backoff.clone(),
            poll_interval: settings.poll_interval,
            committed: OrderStatus::New,
        }
    }

    /// Run the job to completion.
    ///
    /// A failed job fires its own cancellation handle before returning.
    pub async fn run(mut self) -> JobOutcome {
        match self.reconcile().await {
            Ok(outcome) => {
                info!(
                    order = %self.job.order,
                    user = %self.job.user,
                    "job finished"
                );
                outcome
            }
            Err(e) => {
                self.job.cancel.cancel();
                warn!(
                    order = %self.job.order,
                    user = %self.job.user,
                    last_status = %self.committed,
                    reason = %e,
                    "job aborted"
                );
                JobOutcome::Failed(e)
            }
        }
    }
}

/// Private API
impl ReconciliationWorker {
    /// The poll loop: `Polling -> {Polling, RateLimited, Terminal}`.
    async fn reconcile(&mut self) -> Result<JobOutcome, JobError> {
        let mut state = WorkerState::Polling;
        loop {
            state = match state {
                WorkerState::Polling => self.poll_once().await?,
                WorkerState::RateLimited => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        order = %self.job.order,
                        attempt = self.backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "rate limited by scoring service, backing off"
                    );
                    self.guard(tokio::time::sleep(delay)).await?;
                    WorkerState::Polling
                }
                WorkerState::Terminal { status, accrual } => {
                    return self.commit_terminal(status, accrual).await;
                }
            };
        }
    }

    async fn poll_once(&mut self) -> Result<WorkerState, JobError> {
        let outcome = self.guard(self.scoring.poll(&self.job.order)).await??;

        let observation = match outcome {
            PollOutcome::RateLimited => return Ok(WorkerState::RateLimited),
            PollOutcome::NotRegistered => {
                debug!(order = %self.job.order, "order not registered with scoring service yet");
                self.backoff.reset();
                self.pause().await?;
                return Ok(WorkerState::Polling);
            }
            PollOutcome::Observed(observation) => observation,
        };
        self.backoff.reset();

        let Some(status) = observation.status.to_order_status() else {
            debug!(order = %self.job.order, status = ?observation.status, "ignoring unrecognized status");
            self.pause().await?;
            return Ok(WorkerState::Polling);
        };

        if status.is_terminal() {
            return Ok(WorkerState::Terminal {
                status,
                accrual: observation.accrual,
            });
        }

        self.commit_progress(status, observation.accrual).await?;
        self.pause().await?;
        Ok(WorkerState::Polling)
    }

    /// Write an intermediate status, skipping anything that would not move the
    /// order forward.
    async fn commit_progress(
        &mut self,
        status: OrderStatus,
        accrual: Option<Amount>,
    ) -> Result<(), JobError> {
        if status.rank() <= self.committed.rank() {
            return Ok(());
        }

        let lock = Arc::clone(&self.commit_lock);
        let _guard = self.guard(lock.lock()).await?;
        self.ledger
            .update_order(&self.job.user, &self.job.order, status, accrual)
            .await?;
        self.committed = status;
        info!(order = %self.job.order, user = %self.job.user, %status, "order status committed");
        Ok(())
    }

    /// Final commit: terminal status, then the credit for `PROCESSED`.
    ///
    /// Cancellation is only observed while waiting for the lock; once held,
    /// both writes are issued.
    async fn commit_terminal(
        &mut self,
        status: OrderStatus,
        accrual: Option<Amount>,
    ) -> Result<JobOutcome, JobError> {
        let lock = Arc::clone(&self.commit_lock);
        let _guard = self.guard(lock.lock()).await?;

        self.ledger
            .update_order(&self.job.user, &self.job.order, status, accrual)
            .await?;
        self.committed = status;

        if status != OrderStatus::Processed {
            info!(order = %self.job.order, user = %self.job.user, %status, "order status committed");
            return Ok(JobOutcome::Invalid);
        }

        let accrual = accrual.unwrap_or_default();
        self.ledger.credit_balance(&self.job.user, accrual).await?;
        info!(
            order = %self.job.order,
            user = %self.job.user,
            %status,
            accrual = %accrual,
            "order processed, balance credited"
        );
        Ok(JobOutcome::Processed { accrual })
    }

    async fn pause(&self) -> Result<(), JobError> {
        if !self.poll_interval.is_zero() {
            self.guard(tokio::time::sleep(self.poll_interval)).await?;
        }
        Ok(())
    }

    /// Race `fut` against the job's cancellation handle.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, JobError> {
        tokio::select! {
            biased;
            reason = self.job.cancel.cancelled() => Err(reason.into()),
            output = fut => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::CancelHandle;
    use crate::ledger::{LedgerError, MemoryLedger};
    use crate::model::AccrualStatus;
    use crate::scoring::ScoringError;
    use crate::test_support::{
        FailOn, FailingLedger, LedgerEvent, RecordingLedger, ScriptedScoring, observed,
    };
    use tokio::time::Instant;

    // test utils

    const ORDER: &str = "11111111";
    const USER: &str = "alice";

    async fn ledger_with_order() -> Arc<MemoryLedger> {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.register_order(USER, ORDER).await.unwrap();
        ledger
    }

    fn worker(
        scoring: Arc<ScriptedScoring>,
        ledger: Arc<dyn LedgerStore>,
        cancel: CancelHandle,
    ) -> ReconciliationWorker {
        ReconciliationWorker::new(
            Job::new(ORDER, USER, cancel),
            scoring,
            ledger,
            Arc::new(Mutex::new(())),
            &WorkerSettings::default(),
        )
    }

    fn processed(accrual: i64) -> Result<PollOutcome, ScoringError> {
        observed(ORDER, AccrualStatus::Processed, Some(accrual))
    }

    // Terminal commits

    #[tokio::test(start_paused = true)]
    async fn processed_commits_status_and_credits_once() {
        let ledger = ledger_with_order().await;
        let scoring = Arc::new(ScriptedScoring::new().script(
            ORDER,
            [
                observed(ORDER, AccrualStatus::Registered, None),
                observed(ORDER, AccrualStatus::Processing, None),
                processed(10_000),
            ],
        ));

        let outcome = worker(scoring.clone(), ledger.clone(), CancelHandle::new())
            .run()
            .await;

        assert_eq!(
            outcome,
            JobOutcome::Processed {
                accrual: Amount::from_scaled(10_000)
            }
        );
        let order = ledger.order(ORDER).await.unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, Some(Amount::from_scaled(10_000)));
        assert_eq!(ledger.balance(USER).await.current, Amount::from_scaled(10_000));
        assert_eq!(scoring.polls(ORDER), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_commits_status_without_credit() {
        let ledger = ledger_with_order().await;
        let scoring = Arc::new(ScriptedScoring::new().script(
            ORDER,
            [
                observed(ORDER, AccrualStatus::Registered, None),
                observed(ORDER, AccrualStatus::Invalid, None),
            ],
        ));

        let outcome = worker(scoring, ledger.clone(), CancelHandle::new()).run().await;

        assert_eq!(outcome, JobOutcome::Invalid);
        assert_eq!(ledger.order(ORDER).await.unwrap().status, OrderStatus::Invalid);
        assert_eq!(ledger.balance(USER).await.current, Amount::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn registered_is_written_as_processing() {
        let ledger = ledger_with_order().await;
        let cancel = CancelHandle::with_timeout(Duration::from_secs(5));
        let scoring = Arc::new(ScriptedScoring::new().script(
            ORDER,
            [
                observed(ORDER, AccrualStatus::Registered, None),
                Ok(PollOutcome::RateLimited),
            ],
        ));

        let outcome = worker(scoring, ledger.clone(), cancel).run().await;

        assert_eq!(outcome, JobOutcome::Failed(JobError::TimedOut));
        assert_eq!(
            ledger.order(ORDER).await.unwrap().status,
            OrderStatus::Processing
        );
    }

    // Retry behavior

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_retried_until_terminal() {
        let ledger = ledger_with_order().await;
        let mut script: Vec<_> = (0..4).map(|_| Ok(PollOutcome::RateLimited)).collect();
        script.push(processed(500));
        let scoring = Arc::new(ScriptedScoring::new().script(ORDER, script));

        let start = Instant::now();
        let outcome = worker(scoring.clone(), ledger.clone(), CancelHandle::new())
            .run()
            .await;

        assert!(outcome.is_terminal());
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(scoring.polls(ORDER), 5);
        assert_eq!(ledger.balance(USER).await.current, Amount::from_scaled(500));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_orders_are_polled_until_terminal() {
        let ledger = ledger_with_order().await;
        let mut script: Vec<_> = (0..3).map(|_| Ok(PollOutcome::NotRegistered)).collect();
        script.push(processed(500));
        let scoring = Arc::new(ScriptedScoring::new().script(ORDER, script));

        let outcome = worker(scoring.clone(), ledger.clone(), CancelHandle::new())
            .run()
            .await;

        assert_eq!(
            outcome,
            JobOutcome::Processed {
                accrual: Amount::from_scaled(500)
            }
        );
        assert_eq!(scoring.polls(ORDER), 4);
        assert_eq!(ledger.order(ORDER).await.unwrap().status, OrderStatus::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_intermediate_status_is_not_rewritten() {
        let ledger = Arc::new(RecordingLedger::new());
        ledger.inner().register_order(USER, ORDER).await.unwrap();
        let scoring = Arc::new(ScriptedScoring::new().script(
            ORDER,
            [
                observed(ORDER, AccrualStatus::Processing, None),
                observed(ORDER, AccrualStatus::Registered, None),
                observed(ORDER, AccrualStatus::Processing, None),
                processed(100),
            ],
        ));

        let outcome = worker(scoring, ledger.clone(), CancelHandle::new()).run().await;

        assert!(outcome.is_terminal());
        assert_eq!(
            ledger.events(),
            [
                LedgerEvent::Status(ORDER.into(), OrderStatus::Processing),
                LedgerEvent::Status(ORDER.into(), OrderStatus::Processed),
                LedgerEvent::Credit(USER.into(), Amount::from_scaled(100)),
            ]
        );
    }

    // Failures

    #[tokio::test(start_paused = true)]
    async fn transport_error_aborts_job_and_fires_handle() {
        let ledger = ledger_with_order().await;
        let cancel = CancelHandle::new();
        let scoring = Arc::new(ScriptedScoring::new().script(
            ORDER,
            [Err(ScoringError::Transport("connection refused".into()))],
        ));

        let outcome = worker(scoring, ledger.clone(), cancel.clone()).run().await;

        assert!(matches!(
            outcome,
            JobOutcome::Failed(JobError::Scoring(ScoringError::Transport(_)))
        ));
        assert!(cancel.is_cancelled());
        assert_eq!(ledger.order(ORDER).await.unwrap().status, OrderStatus::New);
    }

    #[tokio::test(start_paused = true)]
    async fn endless_rate_limiting_stops_at_deadline() {
        let ledger = ledger_with_order().await;
        let cancel = CancelHandle::with_timeout(Duration::from_secs(10));
        let scoring =
            Arc::new(ScriptedScoring::new().script(ORDER, [Ok(PollOutcome::RateLimited)]));

        let start = Instant::now();
        let outcome = worker(scoring.clone(), ledger.clone(), cancel).run().await;

        assert_eq!(outcome, JobOutcome::Failed(JobError::TimedOut));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(scoring.polls(ORDER) >= 10);
        assert_eq!(ledger.balance(USER).await.current, Amount::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_handle_stops_job() {
        let ledger = ledger_with_order().await;
        let cancel = CancelHandle::new();
        cancel.cancel();
        let scoring = Arc::new(ScriptedScoring::new().script(ORDER, [processed(100)]));

        let outcome = worker(scoring.clone(), ledger.clone(), cancel).run().await;

        assert_eq!(outcome, JobOutcome::Failed(JobError::Cancelled));
        assert_eq!(scoring.polls(ORDER), 0);
        assert_eq!(ledger.balance(USER).await.current, Amount::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_failure_aborts_commit() {
        let ledger = Arc::new(FailingLedger::new(
            FailOn::Status,
            LedgerError::Unavailable("db down".into()),
        ));
        ledger.inner().register_order(USER, ORDER).await.unwrap();
        let cancel = CancelHandle::new();
        let scoring = Arc::new(ScriptedScoring::new().script(ORDER, [processed(100)]));

        let outcome = worker(scoring, ledger.clone(), cancel.clone()).run().await;

        assert!(matches!(
            outcome,
            JobOutcome::Failed(JobError::Ledger(LedgerError::Unavailable(_)))
        ));
        assert!(cancel.is_cancelled());
        assert_eq!(ledger.credits(), 0);
        assert_eq!(ledger.inner().order(ORDER).await.unwrap().status, OrderStatus::New);
    }

    #[tokio::test(start_paused = true)]
    async fn credit_failure_after_status_write_fails_job() {
        let ledger = Arc::new(FailingLedger::new(
            FailOn::Credit,
            LedgerError::Unavailable("db down".into()),
        ));
        ledger.inner().register_order(USER, ORDER).await.unwrap();
        let cancel = CancelHandle::new();
        let scoring = Arc::new(ScriptedScoring::new().script(ORDER, [processed(100)]));

        let outcome = worker(scoring, ledger.clone(), cancel.clone()).run().await;

        assert!(matches!(
            outcome,
            JobOutcome::Failed(JobError::Ledger(LedgerError::Unavailable(_)))
        ));
        assert!(cancel.is_cancelled());
        // the status write is not rolled back
        let order = ledger.inner().order(ORDER).await.unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, Some(Amount::from_scaled(100)));
        assert_eq!(ledger.credits(), 0);
        assert_eq!(ledger.inner().balance(USER).await.current, Amount::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_waits_for_lock_held_elsewhere() {
        let ledger = ledger_with_order().await;
        let scoring = Arc::new(ScriptedScoring::new().script(ORDER, [processed(100)]));
        let lock = Arc::new(Mutex::new(()));
        let held = lock.clone().lock_owned().await;

        let worker = ReconciliationWorker::new(
            Job::new(ORDER, USER, CancelHandle::new()),
            scoring,
            ledger.clone(),
            lock,
            &WorkerSettings::default(),
        );
        let task = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ledger.order(ORDER).await.unwrap().status, OrderStatus::New);
        assert_eq!(ledger.balance(USER).await.current, Amount::ZERO);

        drop(held);
        assert!(task.await.unwrap().is_terminal());
        assert_eq!(ledger.balance(USER).await.current, Amount::from_scaled(100));
    }
}
