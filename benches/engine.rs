use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rental_ledger::config::{LedgerConfig, QueueConfig, SchedulerConfig};
use rental_ledger::pricing::{Pricing, StaticPricing};
use rental_ledger::retry::RetryPolicy;
use rental_ledger::{
    AllocationQueue, Amount, Ledger, MemoryStore, ReconciliationScheduler, RefundEngine,
    RentalSession, SessionId, UserId, Variant,
};
use tokio::runtime::Runtime;

/// Generates expired sessions for benchmarking.
///
/// Sessions are spread round-robin over `num_users` users and cycle
/// through every variant, so each variant namespace sees the same load.
pub struct SessionGenerator {
    next_id: u64,
    total: u64,
    num_users: u64,
}

impl SessionGenerator {
    pub fn new(num_users: u64, total: u64) -> Self {
        Self {
            next_id: 0,
            total,
            num_users,
        }
    }
}

impl Iterator for SessionGenerator {
    type Item = RentalSession;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_id >= self.total {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;

        let variant = Variant::ALL[(id % Variant::ALL.len() as u64) as usize];
        Some(RentalSession::new(
            format!("S{id}"),
            format!("u{}", id % self.num_users),
            variant,
            "whatsapp",
            Amount::from_minor(2_100),
            Utc::now() - ChronoDuration::seconds(60),
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.next_id) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SessionGenerator {}

fn engine_over(sessions: SessionGenerator) -> Arc<RefundEngine> {
    let store = Arc::new(MemoryStore::new());
    for session in sessions {
        store.seed_session(session);
    }
    let ledger = Arc::new(Ledger::new(store, &LedgerConfig::default()));
    let pricing = StaticPricing::new().with_variant_price(Variant::Sms, Amount::from_minor(2_100));
    Arc::new(RefundEngine::new(
        ledger,
        Pricing::new(Arc::new(pricing)),
        RetryPolicy::none(),
    ))
}

fn bench_direct_refunds(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("refunds");

    for count in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_with_setup(
                || engine_over(SessionGenerator::new(10, count)),
                |engine| {
                    rt.block_on(async {
                        for session in SessionGenerator::new(10, count) {
                            black_box(
                                engine
                                    .refund(session.variant, &session.user, &session.id, "bench")
                                    .await,
                            );
                        }
                    })
                },
            );
        });
    }

    group.finish();
}

fn bench_reconciliation_tick(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("reconcile");

    for count in [1_000u64, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_with_setup(
                || {
                    let config = SchedulerConfig {
                        batch_size: count as usize,
                        ..SchedulerConfig::default()
                    };
                    ReconciliationScheduler::new(engine_over(SessionGenerator::new(100, count)), config)
                },
                |scheduler| black_box(rt.block_on(scheduler.run_now())),
            );
        });
    }

    group.finish();
}

fn bench_allocation_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_queue");

    group.bench_function("check_add_remove_10k_users", |b| {
        b.iter(|| {
            let queue = AllocationQueue::new(QueueConfig {
                capacity: 64,
                cooldown_ms: 3_000,
                entry_ttl_secs: 360,
                sweep_interval_secs: 60,
            });
            let session = SessionId::from("S");
            for n in 0..10_000u32 {
                let user = UserId::new(format!("u{n}"));
                if black_box(queue.check_limit(&user)).is_allowed() {
                    queue.add_entry(&user, format!("+1555{n:07}"), &session);
                }
                if n % 2 == 0 {
                    queue.remove_entry(&user, &format!("+1555{n:07}"));
                }
            }
            queue
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = bench_direct_refunds, bench_reconciliation_tick, bench_allocation_queue
}
criterion_main!(benches);
