use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::model::{RentalSession, SessionStatus, UnknownVariant, UserId, Variant};

/// Errors that can occur when reading or writing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized record type '{record_type}'")]
    UnrecognizedType { line: usize, record_type: String },

    #[error("line {line}: {record_type} missing {field}")]
    MissingField {
        line: usize,
        record_type: String,
        field: &'static str,
    },

    #[error("line {line}: {source}")]
    Variant { line: usize, source: UnknownVariant },

    #[error("line {line}: unrecognized session status '{status}'")]
    UnrecognizedStatus { line: usize, status: String },

    #[error("failed to write output: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush output: {0}")]
    Flush(#[from] io::Error),
}

/// One input record.
#[derive(Debug, Clone, PartialEq)]
pub enum InputRecord {
    Deposit {
        user: UserId,
        amount: Amount,
        reference: String,
    },
    /// A rental to charge. `status` is applied after the charge.
    Session {
        session: RentalSession,
        status: SessionStatus,
    },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    user: UserId,
    session: Option<String>,
    variant: Option<String>,
    service: Option<String>,
    amount: Option<f64>,
    /// Seconds until expiry; negative for already expired sessions
    expires_in: Option<i64>,
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    user: &'a str,
    balance: String,
}

/// Parsed rows of an input file, in file order
pub type Records = Box<dyn Iterator<Item = Result<InputRecord, CsvError>> + Send>;

/// Read deposits and sessions from a csv file
pub fn read_records(path: impl AsRef<Path>) -> Result<Records, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(Box::new(
        reader
            .into_deserialize::<InputRow>()
            .enumerate()
            .map(|(idx, result)| {
                let line = idx + 2; // 1-indexed, skip header
                let row = result.map_err(|source| CsvError::Parse { line, source })?;
                parse_row(line, row)
            }),
    ))
}

fn parse_row(line: usize, row: InputRow) -> Result<InputRecord, CsvError> {
    let missing = |record_type: &str, field| CsvError::MissingField {
        line,
        record_type: record_type.to_string(),
        field,
    };
    match row.r#type.as_str() {
        "deposit" => {
            let amount = row.amount.ok_or_else(|| missing("deposit", "amount"))?;
            Ok(InputRecord::Deposit {
                reference: row
                    .session
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| format!("deposit_{}_line{line}", row.user)),
                user: row.user,
                amount: Amount::from_major(amount),
            })
        }
        "session" => {
            let id = row.session.ok_or_else(|| missing("session", "session"))?;
            let variant: Variant = row
                .variant
                .ok_or_else(|| missing("session", "variant"))?
                .parse()
                .map_err(|source| CsvError::Variant { line, source })?;
            let cost = row.amount.ok_or_else(|| missing("session", "amount"))?;
            let expires_in = row.expires_in.ok_or_else(|| missing("session", "expires_in"))?;
            let status = match row.status.as_deref().unwrap_or("waiting") {
                "" | "waiting" => SessionStatus::Waiting,
                "completed" => SessionStatus::Completed,
                "expired" => SessionStatus::Expired,
                other => {
                    return Err(CsvError::UnrecognizedStatus {
                        line,
                        status: other.to_string(),
                    });
                }
            };
            let session = RentalSession::new(
                id,
                row.user,
                variant,
                row.service.unwrap_or_default(),
                Amount::from_major(cost),
                Utc::now() + ChronoDuration::seconds(expires_in),
            );
            Ok(InputRecord::Session { session, status })
        }
        other => Err(CsvError::UnrecognizedType {
            line,
            record_type: other.to_string(),
        }),
    }
}

/// Write user balances in csv format
pub fn write_balances(
    writer: impl io::Write,
    balances: impl IntoIterator<Item = (UserId, Amount)>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for (user, balance) in balances {
        writer.serialize(OutputRow {
            user: user.as_str(),
            balance: balance.to_string(),
        })?;
    }

    writer.flush()?;
    Ok(())
}
