pub mod amount;
pub mod config;
pub mod csv;
pub mod dispatcher;
pub mod job;
pub mod ledger;
pub mod model;
pub mod scoring;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use amount::Amount;
pub use config::Config;
pub use dispatcher::{DispatchError, DispatcherHandle, DispatcherSettings, JobDispatcher, JobReport};
pub use ledger::{LedgerStore, MemoryLedger};
pub use scoring::{HttpScoringClient, PollOutcome, Scoring};
pub use worker::{JobError, JobOutcome, ReconciliationWorker};
