use serde::Deserialize;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::model::{Balance, Order, is_order_number};

/// Errors that can occur when reading submission rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open submissions: {0}")]
    Open(#[source] csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: invalid order number '{order}'")]
    InvalidOrder { line: usize, order: String },

    #[error("line {line}: missing user")]
    MissingUser { line: usize },
}

/// One order upload to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubmissionRow {
    pub user: String,
    pub order: String,
}

/// Read `user,order` rows from a csv file
pub fn read_submissions(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<SubmissionRow, CsvError>>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<SubmissionRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            if row.user.is_empty() {
                return Err(CsvError::MissingUser { line });
            }
            if !is_order_number(&row.order) {
                return Err(CsvError::InvalidOrder {
                    line,
                    order: row.order,
                });
            }
            Ok(row)
        }))
}

/// Write orders, then balances, as two csv tables
pub fn write_ledger(
    writer: impl io::Write,
    orders: &[Order],
    balances: &[(String, Balance)],
) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(writer);

    writer.write_record(["user", "order", "status", "accrual"])?;
    for order in orders {
        let accrual = order.accrual.map(|a| a.to_string()).unwrap_or_default();
        writer.write_record([
            order.user.as_str(),
            order.number.as_str(),
            order.status.as_str(),
            accrual.as_str(),
        ])?;
    }

    writer.write_record(["user", "current", "withdrawn"])?;
    for (user, balance) in balances {
        writer.write_record([
            user.clone(),
            balance.current.to_string(),
            balance.withdrawn.to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}
