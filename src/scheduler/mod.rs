//! Reconciliation scheduler.
//!
//! Periodically finds expired, unrefunded sessions of every variant and
//! drives them through the [`RefundEngine`]. It is the safety net behind
//! the instant trigger: anything the trigger missed, because the process
//! restarted or a call failed, is picked up here.
//!
//! Scans are incremental between regular ticks. A full scan is forced on
//! the first tick, after a gap longer than the missed-tick threshold, and
//! after a tick that hit the batch cap or could not settle a candidate.
//! When the previous query found nothing, incremental queries are skipped
//! until the idle cooldown elapses; incremental windows always start at
//! the last query, so skipped ticks leave no hole.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::lifecycle::{LifecycleError, Running};
use crate::model::{RentalSession, Variant};
use crate::refund::{RefundEngine, RefundStatus};
use crate::store::ScanWindow;

mod cache;
pub use cache::{CacheReason, ProcessedCache};

const RECONCILE_REASON: &str = "session expired, reconciled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Full,
    Incremental,
    /// Query skipped by the idle short-circuit.
    Idle,
    /// The candidate query itself failed.
    Failed,
}

/// Outcome of one variant's scan within a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantReport {
    pub variant: Variant,
    pub mode: ScanMode,
    pub scanned: usize,
    pub refunded: usize,
    pub already_processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl VariantReport {
    fn new(variant: Variant, mode: ScanMode) -> Self {
        Self {
            variant,
            mode,
            scanned: 0,
            refunded: 0,
            already_processed: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub variants: Vec<VariantReport>,
}

impl TickReport {
    pub fn variant(&self, variant: Variant) -> Option<&VariantReport> {
        self.variants.iter().find(|r| r.variant == variant)
    }

    pub fn refunded(&self) -> usize {
        self.variants.iter().map(|r| r.refunded).sum()
    }

    pub fn failed(&self) -> usize {
        self.variants.iter().map(|r| r.failed).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub tick_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub cache_size: usize,
    pub last_report: Option<TickReport>,
}

#[derive(Debug, Default)]
struct VariantScan {
    last_query_at: Option<DateTime<Utc>>,
    last_query_instant: Option<Instant>,
    found_nothing: bool,
    force_full: bool,
}

/// State owned by whichever tick is running.
#[derive(Debug)]
struct TickState {
    last_tick: Option<Instant>,
    scans: HashMap<Variant, VariantScan>,
    cache: ProcessedCache,
}

#[derive(Debug, Default)]
struct Stats {
    tick_count: u64,
    last_run: Option<DateTime<Utc>>,
    cache_size: usize,
    last_report: Option<TickReport>,
}

struct Inner {
    engine: Arc<RefundEngine>,
    config: SchedulerConfig,
    tick_state: tokio::sync::Mutex<TickState>,
    stats: Mutex<Stats>,
}

pub struct ReconciliationScheduler {
    inner: Arc<Inner>,
    runner: Mutex<Option<Running>>,
}

/// Public API
impl ReconciliationScheduler {
    pub fn new(engine: Arc<RefundEngine>, config: SchedulerConfig) -> Self {
        let cache = ProcessedCache::new(config.cache_ttl());
        Self {
            inner: Arc::new(Inner {
                engine,
                config,
                tick_state: tokio::sync::Mutex::new(TickState {
                    last_tick: None,
                    scans: HashMap::new(),
                    cache,
                }),
                stats: Mutex::new(Stats::default()),
            }),
            runner: Mutex::new(None),
        }
    }

    /// Run one tick immediately, then one every interval.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            return Err(LifecycleError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let period = inner.config.interval().max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.tick().await;
                    }
                }
            }
            debug!("reconciliation loop exited");
        });
        *runner = Some(Running { cancel, handle });
        info!(
            interval_secs = self.inner.config.interval_secs,
            batch_size = self.inner.config.batch_size,
            "reconciliation scheduler started"
        );
        Ok(())
    }

    /// Stop the timer. A tick already in progress completes first.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let running = self
            .runner
            .lock()
            .take()
            .ok_or(LifecycleError::NotRunning)?;
        running.shutdown().await;
        info!("reconciliation scheduler stopped");
        Ok(())
    }

    /// Run one tick now, waiting for any tick in progress.
    pub async fn run_now(&self) -> TickReport {
        self.inner.tick().await
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = self.runner.lock().is_some();
        let stats = self.inner.stats.lock();
        let next_run = match (running, stats.last_run) {
            (true, Some(last)) => chrono::Duration::from_std(self.inner.config.interval())
                .ok()
                .and_then(|interval| last.checked_add_signed(interval)),
            _ => None,
        };
        SchedulerStatus {
            running,
            tick_count: stats.tick_count,
            last_run: stats.last_run,
            next_run,
            cache_size: stats.cache_size,
            last_report: stats.last_report.clone(),
        }
    }
}

impl Inner {
    async fn tick(&self) -> TickReport {
        let mut state = self.tick_state.lock().await;
        let started_at = Utc::now();
        let now = Instant::now();

        let gap_exceeded = state
            .last_tick
            .is_none_or(|last| now.saturating_duration_since(last) > self.config.missed_tick_threshold());
        state.last_tick = Some(now);

        let mut variants = Vec::with_capacity(Variant::ALL.len());
        for variant in Variant::ALL {
            variants.push(self.scan_variant(&mut state, variant, gap_exceeded).await);
        }

        let swept = state.cache.sweep();
        let report = TickReport {
            started_at,
            variants,
        };
        info!(
            refunded = report.refunded(),
            failed = report.failed(),
            cache_size = state.cache.len(),
            swept,
            "reconciliation tick finished"
        );

        let mut stats = self.stats.lock();
        stats.tick_count += 1;
        stats.last_run = Some(started_at);
        stats.cache_size = state.cache.len();
        stats.last_report = Some(report.clone());
        report
    }

    async fn scan_variant(
        &self,
        state: &mut TickState,
        variant: Variant,
        gap_exceeded: bool,
    ) -> VariantReport {
        let now = Instant::now();
        let wall_now = Utc::now();
        let scan = state.scans.entry(variant).or_default();

        let full = gap_exceeded || scan.force_full || scan.last_query_at.is_none();
        let idle = !full
            && scan.found_nothing
            && scan
                .last_query_instant
                .is_some_and(|at| now.saturating_duration_since(at) < self.config.idle_cooldown());
        if idle {
            debug!(variant = %variant, "no recent candidates, query skipped");
            return VariantReport::new(variant, ScanMode::Idle);
        }

        let (mode, window) = match (full, scan.last_query_at) {
            (false, Some(since)) => (ScanMode::Incremental, ScanWindow::incremental(since, wall_now)),
            _ => (ScanMode::Full, ScanWindow::full(wall_now)),
        };

        let store = self.engine.ledger().store();
        let candidates = match store
            .refund_candidates(variant, window, self.config.batch_size)
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(variant = %variant, reason = %err, "candidate query failed");
                scan.force_full = true;
                return VariantReport::new(variant, ScanMode::Failed);
            }
        };

        scan.last_query_at = Some(wall_now);
        scan.last_query_instant = Some(now);
        scan.found_nothing = candidates.is_empty();
        let saturated = candidates.len() >= self.config.batch_size;

        let mut report = VariantReport::new(variant, mode);
        report.scanned = candidates.len();
        for candidate in candidates {
            self.settle(&mut state.cache, candidate, &mut report).await;
        }

        // Candidates past the cap or left unsettled may sit before the next
        // incremental window; only a full scan will see them again.
        if let Some(scan) = state.scans.get_mut(&variant) {
            scan.force_full = saturated || report.failed > 0;
        }
        if saturated {
            warn!(
                variant = %variant,
                batch_size = self.config.batch_size,
                "candidate batch saturated, next scan is full"
            );
        }
        report
    }

    async fn settle(
        &self,
        cache: &mut ProcessedCache,
        candidate: RentalSession,
        report: &mut VariantReport,
    ) {
        let variant = candidate.variant;
        if cache.get(variant, &candidate.id).is_some() {
            report.skipped += 1;
            return;
        }

        let store = self.engine.ledger().store();
        let row = match store.session(variant, &candidate.id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                report.skipped += 1;
                return;
            }
            Err(err) => {
                warn!(
                    variant = %variant,
                    session = %candidate.id,
                    reason = %err,
                    "candidate re-check failed"
                );
                report.failed += 1;
                return;
            }
        };
        if !row.is_refund_eligible(Utc::now()) {
            report.skipped += 1;
            return;
        }

        let outcome = self
            .engine
            .refund(variant, &row.user, &row.id, RECONCILE_REASON)
            .await;
        match outcome.status {
            RefundStatus::Refunded => {
                cache.insert(variant, row.id, CacheReason::Refunded);
                report.refunded += 1;
            }
            RefundStatus::AlreadyProcessed => {
                cache.insert(variant, row.id, CacheReason::VerifiedExistingRefund);
                report.already_processed += 1;
            }
            RefundStatus::Ineligible(_) | RefundStatus::NotFound => report.skipped += 1,
            RefundStatus::Failed => report.failed += 1,
        }
    }
}
