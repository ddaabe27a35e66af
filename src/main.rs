use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use rental_ledger::csv::{CsvError, InputRecord, read_records, write_balances};
use rental_ledger::pricing::{Pricing, StaticPricing};
use rental_ledger::{
    Ledger, MemoryStore, ReconciliationScheduler, RefundEngine, Settings, Store,
};
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum AppError {
    #[error("usage: rental-ledger <input.csv> [settings.toml]")]
    Usage,
    #[error("invalid settings: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Csv(#[from] CsvError),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AppError> {
    let mut args = env::args().skip(1);
    let path = args.next().ok_or(AppError::Usage)?;
    let settings_path = args.next().map(PathBuf::from);

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let settings = Settings::load(settings_path.as_deref())?;
    let records = read_records(&path)?;

    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(Ledger::new(store.clone(), &settings.ledger));
    let pricing = Pricing::new(Arc::new(StaticPricing::from_config(&settings.pricing)));
    let engine = Arc::new(RefundEngine::new(
        ledger.clone(),
        pricing,
        settings.retry.policy(),
    ));

    let (record_sender, record_receiver) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        for result in records {
            match result {
                Ok(record) => {
                    if record_sender.send(record).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let mut stream = ReceiverStream::new(record_receiver);
    while let Some(record) = stream.next().await {
        apply(&ledger, store.as_ref(), record).await;
    }

    let scheduler = ReconciliationScheduler::new(engine, settings.scheduler);
    let report = scheduler.run_now().await;
    info!(
        refunded = report.refunded(),
        failed = report.failed(),
        "reconciliation pass finished"
    );

    write_balances(io::stdout().lock(), store.balances())?;
    Ok(())
}

async fn apply(ledger: &Ledger, store: &MemoryStore, record: InputRecord) {
    match record {
        InputRecord::Deposit {
            user,
            amount,
            reference,
        } => {
            if let Err(e) = ledger.deposit(&user, amount, reference).await {
                warn!(user = %user, "deposit rejected: {e}");
            }
        }
        InputRecord::Session { session, status } => {
            let (variant, id, user) = (session.variant, session.id.clone(), session.user.clone());
            if let Err(e) = ledger.charge(session).await {
                warn!(user = %user, session = %id, "charge rejected: {e}");
                return;
            }
            if status.is_terminal() {
                if let Err(e) = store.close_session(variant, &id, status, Utc::now()).await {
                    warn!(session = %id, "failed to close session: {e}");
                }
            }
        }
    }
}

