//! Allocation queue: process-local rate limiter for the shared number pool.
//!
//! Two independent gates guard every new allocation:
//!
//! - a per-user cooldown since that user's last allocation,
//! - a global ceiling on simultaneously held allocations.
//!
//! Entries leave the queue when released with [`AllocationQueue::remove_entry`]
//! or when they outlive the entry TTL. Expired entries are swept by a
//! periodic task and opportunistically on every check and status call, which
//! bounds growth from allocations that are never released.
//!
//! Nothing is persisted. A restart clears the queue; held numbers are short
//! external reservations whose refunds are driven by persistent session
//! state, not by this queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::lifecycle::{LifecycleError, Running};
use crate::model::{SessionId, UserId};

/// One held allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationEntry {
    pub resource_id: String,
    pub user: UserId,
    pub session: SessionId,
    pub added_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The user allocated too recently.
    UserCooldown,
    /// The pool is at capacity.
    CapacityReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Blocked { reason: BlockReason, wait: Duration },
}

impl LimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allowed)
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub occupancy: usize,
    pub capacity: usize,
    pub tracked_users: usize,
    pub oldest_entry_age: Option<Duration>,
    pub sweeping: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Held allocations, oldest first
    pending: VecDeque<AllocationEntry>,
    last_allocation: HashMap<UserId, Instant>,
}

#[derive(Debug)]
struct Inner {
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl Inner {
    /// Drop entries past their TTL and cooldown stamps that no longer block.
    fn sweep(&self, now: Instant) -> usize {
        let ttl = self.config.entry_ttl();
        let cooldown = self.config.cooldown();
        let mut state = self.state.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|entry| now.saturating_duration_since(entry.added_at) < ttl);
        state
            .last_allocation
            .retain(|_, at| now.saturating_duration_since(*at) < cooldown);
        let removed = before - state.pending.len();
        if removed > 0 {
            debug!(removed, remaining = state.pending.len(), "expired allocations swept");
        }
        removed
    }
}

/// Global allocation rate limiter.
///
/// All mutations are synchronous and complete under one short lock, so the
/// queue can be shared freely between request handlers.
pub struct AllocationQueue {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<Running>>,
}

/// Public API
impl AllocationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QueueState::default()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Whether `user` may allocate now.
    pub fn check_limit(&self, user: &UserId) -> LimitDecision {
        let now = Instant::now();
        self.inner.sweep(now);
        let config = &self.inner.config;
        let state = self.inner.state.lock();

        if let Some(&last) = state.last_allocation.get(user) {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < config.cooldown() {
                return LimitDecision::Blocked {
                    reason: BlockReason::UserCooldown,
                    wait: config.cooldown() - elapsed,
                };
            }
        }

        if state.pending.len() >= config.capacity {
            let wait = state
                .pending
                .front()
                .map(|oldest| {
                    config
                        .entry_ttl()
                        .saturating_sub(now.saturating_duration_since(oldest.added_at))
                })
                .unwrap_or_default();
            warn!(
                user = %user,
                occupancy = state.pending.len(),
                capacity = config.capacity,
                "allocation pool at capacity"
            );
            return LimitDecision::Blocked {
                reason: BlockReason::CapacityReached,
                wait,
            };
        }

        LimitDecision::Allowed
    }

    /// Record an allocation and start the user's cooldown.
    ///
    /// Callers must have just passed [`AllocationQueue::check_limit`]; the
    /// limits are not re-checked here.
    pub fn add_entry(&self, user: &UserId, resource_id: impl Into<String>, session: &SessionId) {
        let now = Instant::now();
        let resource_id = resource_id.into();
        let mut state = self.inner.state.lock();
        state.pending.push_back(AllocationEntry {
            resource_id: resource_id.clone(),
            user: user.clone(),
            session: session.clone(),
            added_at: now,
        });
        state.last_allocation.insert(user.clone(), now);
        debug!(
            user = %user,
            resource = %resource_id,
            session = %session,
            occupancy = state.pending.len(),
            "allocation recorded"
        );
    }

    /// Release a held allocation. Returns whether an entry was removed.
    pub fn remove_entry(&self, user: &UserId, resource_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let position = state
            .pending
            .iter()
            .position(|entry| &entry.user == user && entry.resource_id == resource_id);
        match position {
            Some(idx) => {
                state.pending.remove(idx);
                debug!(user = %user, resource = resource_id, "allocation released");
                true
            }
            None => false,
        }
    }

    /// Sweep expired entries now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep(Instant::now())
    }

    pub fn status(&self) -> QueueStatus {
        let now = Instant::now();
        self.inner.sweep(now);
        let state = self.inner.state.lock();
        QueueStatus {
            occupancy: state.pending.len(),
            capacity: self.inner.config.capacity,
            tracked_users: state.last_allocation.len(),
            oldest_entry_age: state
                .pending
                .front()
                .map(|entry| now.saturating_duration_since(entry.added_at)),
            sweeping: self.sweeper.lock().is_some(),
        }
    }

    /// Start the periodic sweep. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return Err(LifecycleError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let period = self.inner.config.sweep_interval().max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.sweep(Instant::now());
                    }
                }
            }
        });
        *sweeper = Some(Running { cancel, handle });
        info!(
            capacity = self.inner.config.capacity,
            ttl_secs = self.inner.config.entry_ttl_secs,
            "allocation queue sweeper started"
        );
        Ok(())
    }

    /// Stop the periodic sweep. Held entries are kept.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let running = self
            .sweeper
            .lock()
            .take()
            .ok_or(LifecycleError::NotRunning)?;
        running.shutdown().await;
        info!("allocation queue sweeper stopped");
        Ok(())
    }
}
