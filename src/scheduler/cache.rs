use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::model::{SessionId, Variant};

/// Why a session was recorded as handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheReason {
    Refunded,
    VerifiedExistingRefund,
}

/// Sessions the scheduler has already settled, kept for `ttl`.
///
/// Purely a query-saving layer: the claim flag in the store decides
/// correctness, so losing this cache only costs extra lookups.
#[derive(Debug)]
pub struct ProcessedCache {
    ttl: Duration,
    entries: HashMap<(Variant, SessionId), (CacheReason, Instant)>,
}

impl ProcessedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, variant: Variant, session: SessionId, reason: CacheReason) {
        self.entries
            .insert((variant, session), (reason, Instant::now()));
    }

    pub fn get(&self, variant: Variant, session: &SessionId) -> Option<CacheReason> {
        let (reason, at) = self.entries.get(&(variant, session.clone()))?;
        (at.elapsed() < self.ttl).then_some(*reason)
    }

    /// Drop expired entries, returning how many were removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, (_, at)| at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
