use std::env;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use accrual_reconciler::csv::{read_submissions, write_ledger};
use accrual_reconciler::{
    Config, DispatcherSettings, JobDispatcher, JobOutcome, JobReport, MemoryLedger,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: accrual-reconciler [-r <accrual address>] <submissions.csv>";

#[derive(Debug, Default)]
struct Summary {
    processed: usize,
    invalid: usize,
    failed: usize,
}

/// Count job outcomes until the dispatcher is gone.
async fn summarize(mut reports: broadcast::Receiver<JobReport>) -> Summary {
    let mut summary = Summary::default();
    loop {
        match reports.recv().await {
            Ok(report) => match report.outcome {
                JobOutcome::Processed { .. } => summary.processed += 1,
                JobOutcome::Invalid => summary.invalid += 1,
                JobOutcome::Failed(e) => {
                    summary.failed += 1;
                    warn!(order = %report.order, user = %report.user, "order left unreconciled: {e}");
                }
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "job reports were dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    summary
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let path = match config.apply_args(env::args().skip(1)) {
        Ok(args) if args.len() == 1 => args[0].clone(),
        Ok(_) => {
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }
    let rows = match read_submissions(&path) {
        Ok(rows) => rows,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!(accrual = %config.accrual_address, "starting reconciliation");
    let ledger = Arc::new(MemoryLedger::new());
    let (dispatcher, handle) = match JobDispatcher::with_accrual_url(
        &config.accrual_address,
        ledger.clone(),
        DispatcherSettings::from(&config),
        config.http_timeout,
    ) {
        Ok(parts) => parts,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let summary = tokio::spawn(summarize(handle.subscribe()));
    let run = tokio::spawn(dispatcher.run());

    for result in rows {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        if let Err(e) = ledger.register_order(&row.user, &row.order).await {
            warn!(order = %row.order, user = %row.user, "{e}");
            continue;
        }
        if let Err(e) = handle.submit(row.order.as_str(), row.user.as_str()).await {
            warn!(order = %row.order, user = %row.user, "{e}");
        }
    }

    // let in-flight jobs finish, then report
    handle.shutdown();
    if let Err(e) = run.await {
        error!("dispatcher failed: {e}");
        return ExitCode::FAILURE;
    }

    // the report channel closes once the last handle is gone
    drop(handle);
    match summary.await {
        Ok(Summary {
            processed,
            invalid,
            failed,
        }) => info!(processed, invalid, failed, "reconciliation finished"),
        Err(e) => warn!("failed to summarize job reports: {e}"),
    }

    let orders = ledger.orders().await;
    let balances = ledger.balances().await;
    if let Err(e) = write_ledger(io::stdout().lock(), &orders, &balances) {
        error!("failed to write ledger: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
