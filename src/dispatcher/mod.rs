//! Job intake and fan-out.
//!
//! [`JobDispatcher::new`] returns two halves: the [`JobDispatcher`] loop, which
//! is driven by [`run`](JobDispatcher::run), and a cloneable
//! [`DispatcherHandle`] used to submit jobs, observe their outcomes and shut
//! the loop down.
//!
//! `submit` is a rendezvous: it returns only once the loop has taken the job,
//! so a busy loop throttles submitters. Every accepted job gets its own task;
//! the loop never waits on a worker except to drain them when it stops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::Config;
use crate::job::{CancelHandle, Job};
use crate::ledger::LedgerStore;
use crate::scoring::{HttpScoringClient, Scoring, ScoringError};
use crate::worker::{JobOutcome, ReconciliationWorker, WorkerSettings};

mod error;
pub use error::DispatchError;

/// Reports buffered per subscriber before the slowest one starts lagging.
const REPORT_CAPACITY: usize = 1024;

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Budget of each job, counted from submission.
    pub job_timeout: Duration,
    /// Cap on concurrently running workers; `None` spawns one per job.
    pub max_concurrent_jobs: Option<usize>,
    pub worker: WorkerSettings,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(10),
            max_concurrent_jobs: None,
            worker: WorkerSettings::default(),
        }
    }
}

impl From<&Config> for DispatcherSettings {
    fn from(config: &Config) -> Self {
        Self {
            job_timeout: config.job_timeout,
            max_concurrent_jobs: config.max_concurrent_jobs,
            worker: config.worker_settings(),
        }
    }
}

/// Outcome of one finished job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub order: String,
    pub user: String,
    pub outcome: JobOutcome,
}

/// A job travelling to the loop, with the submitter waiting on `accepted`.
///
/// Dropping a submission anywhere before a worker takes it releases its order.
struct Submission {
    job: Job,
    claim: InFlight,
    accepted: oneshot::Sender<()>,
}

/// State shared by the loop, its workers and every handle.
struct Shared {
    shutdown: watch::Sender<bool>,
    /// Orders currently being reconciled.
    in_flight: Mutex<HashMap<String, CancelHandle>>,
    reports: broadcast::Sender<JobReport>,
    job_timeout: Duration,
}

impl Shared {
    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelHandle>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(self: &Arc<Self>, order: &str, cancel: CancelHandle) -> Result<InFlight, DispatchError> {
        let mut in_flight = self.in_flight();
        if in_flight.contains_key(order) {
            return Err(DispatchError::AlreadyInFlight(order.to_string()));
        }
        in_flight.insert(order.to_string(), cancel);
        Ok(InFlight {
            shared: Arc::clone(self),
            order: order.to_string(),
        })
    }

    fn release(&self, order: &str) {
        self.in_flight().remove(order);
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Cloneable front of a running [`JobDispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    intake: mpsc::Sender<Submission>,
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    /// Hand a new order to the dispatcher.
    ///
    /// Waits until the loop accepts the job. The job's timeout starts now.
    pub async fn submit(
        &self,
        order: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<(), DispatchError> {
        if self.shared.is_shut_down() {
            return Err(DispatchError::ChannelClosed);
        }

        let order = order.into();
        let cancel = CancelHandle::with_timeout(self.shared.job_timeout);
        let claim = self.shared.claim(&order, cancel.clone())?;

        // if this future is dropped mid-send, the submission and its claim go with it
        let (accepted, accepted_rx) = oneshot::channel();
        let submission = Submission {
            job: Job::new(order.clone(), user, cancel),
            claim,
            accepted,
        };

        let delivered = match self.intake.send(submission).await {
            Ok(()) => accepted_rx.await.is_ok(),
            Err(_) => false,
        };
        if !delivered {
            return Err(DispatchError::ChannelClosed);
        }

        debug!(order, "job accepted");
        Ok(())
    }

    /// Receive a [`JobReport`] for every job finishing after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<JobReport> {
        self.shared.reports.subscribe()
    }

    /// Stop accepting jobs. Jobs already in flight keep running until they
    /// finish or their own timeout fires.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.send_replace(true) {
            info!("dispatcher shutting down");
        }
    }

    /// Shut down and fire the cancellation handle of every in-flight job.
    pub fn abort_all(&self) {
        self.shutdown();
        for (order, cancel) in self.shared.in_flight().iter() {
            debug!(order, "cancelling job");
            cancel.cancel();
        }
    }

    pub fn is_in_flight(&self, order: &str) -> bool {
        self.shared.in_flight().contains_key(order)
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight().len()
    }
}

/// The dispatch loop.
pub struct JobDispatcher {
    intake: mpsc::Receiver<Submission>,
    shared: Arc<Shared>,
    scoring: Arc<dyn Scoring>,
    ledger: Arc<dyn LedgerStore>,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
    limiter: Option<Arc<Semaphore>>,
    worker: WorkerSettings,
}

/// Public API
impl JobDispatcher {
    pub fn new(
        scoring: Arc<dyn Scoring>,
        ledger: Arc<dyn LedgerStore>,
        settings: DispatcherSettings,
    ) -> (Self, DispatcherHandle) {
        // capacity 1 plus the acceptance ack gives rendezvous semantics
        let (intake_tx, intake_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);

        let shared = Arc::new(Shared {
            shutdown,
            in_flight: Mutex::new(HashMap::new()),
            reports,
            job_timeout: settings.job_timeout,
        });

        let dispatcher = Self {
            intake: intake_rx,
            shared: Arc::clone(&shared),
            scoring,
            ledger,
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
            limiter: settings
                .max_concurrent_jobs
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
            worker: settings.worker,
        };
        let handle = DispatcherHandle {
            intake: intake_tx,
            shared,
        };
        (dispatcher, handle)
    }

    /// Dispatcher polling the scoring service at `accrual_url`.
    pub fn with_accrual_url(
        accrual_url: &str,
        ledger: Arc<dyn LedgerStore>,
        settings: DispatcherSettings,
        request_timeout: Duration,
    ) -> Result<(Self, DispatcherHandle), ScoringError> {
        let scoring = HttpScoringClient::new(accrual_url, request_timeout)?;
        Ok(Self::new(Arc::new(scoring), ledger, settings))
    }

    /// Accept and spawn jobs until shutdown, then wait for in-flight workers.
    pub async fn run(self) {
        let Self {
            intake,
            shared,
            scoring,
            ledger,
            commit_lock,
            limiter,
            worker: worker_settings,
        } = self;

        let mut shutdown = shared.shutdown.subscribe();
        let mut intake = ReceiverStream::new(intake);
        let mut workers = JoinSet::new();
        info!("dispatcher started");

        loop {
            let submission = tokio::select! {
                biased;
                _ = shut_down(&mut shutdown) => break,
                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    reap(result);
                    continue;
                }
                next = intake.next() => match next {
                    Some(submission) => submission,
                    None => break,
                },
            };

            let permit = match &limiter {
                Some(limiter) => tokio::select! {
                    biased;
                    _ = shut_down(&mut shutdown) => break,
                    permit = Arc::clone(limiter).acquire_owned() => permit.ok(),
                },
                None => None,
            };

            let Submission {
                job,
                claim,
                accepted,
            } = submission;
            if accepted.send(()).is_err() {
                // the submitter stopped waiting; dropping the claim releases the order
                continue;
            }
            info!(
                order = %job.order,
                user = %job.user,
                budget = ?job.cancel.remaining(),
                "running job"
            );

            let span = info_span!("reconcile", order = %job.order, user = %job.user);
            let user = job.user.clone();
            let worker = ReconciliationWorker::new(
                job,
                Arc::clone(&scoring),
                Arc::clone(&ledger),
                Arc::clone(&commit_lock),
                &worker_settings,
            );
            workers.spawn(
                async move {
                    let outcome = worker.run().await;
                    drop(permit);
                    claim.finish(user, outcome);
                }
                .instrument(span),
            );
        }

        // closing the intake fails every submitter still waiting
        drop(intake);
        if !workers.is_empty() {
            info!(in_flight = workers.len(), "waiting for in-flight jobs");
        }
        while let Some(result) = workers.join_next().await {
            reap(result);
        }
        info!("dispatcher stopped");
    }
}

/// Claim on an in-flight order.
///
/// Released when dropped: by the worker when it ends (even by panic), or with
/// a submission that never reached a worker.
struct InFlight {
    shared: Arc<Shared>,
    order: String,
}

impl InFlight {
    fn finish(self, user: String, outcome: JobOutcome) {
        let report = JobReport {
            order: self.order.clone(),
            user,
            outcome,
        };
        let shared = Arc::clone(&self.shared);
        drop(self);
        // no subscribers is fine
        let _ = shared.reports.send(report);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.release(&self.order);
    }
}

async fn shut_down(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

fn reap(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(reason = %e, "worker panicked");
        } else {
            warn!(reason = %e, "worker task cancelled");
        }
    }
}
