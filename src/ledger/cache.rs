use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::Amount;
use crate::model::UserId;

/// Short-lived read cache in front of the store's balance lookup.
///
/// Never consulted by writers: every mutation goes to the store and then
/// invalidates the affected users. Each invalidation bumps the user's
/// generation, and a fill is dropped when the generation moved since its
/// read began, so a read that raced a write never lands in the cache.
#[derive(Debug)]
pub struct BalanceCache {
    ttl: Duration,
    entries: Mutex<HashMap<UserId, Slot>>,
}

#[derive(Debug, Default)]
struct Slot {
    cached: Option<(Amount, Instant)>,
    generation: u64,
}

impl BalanceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, user: &UserId) -> Option<Amount> {
        let mut entries = self.entries.lock();
        let slot = entries.get_mut(user)?;
        match slot.cached {
            Some((amount, cached_at)) if cached_at.elapsed() < self.ttl => Some(amount),
            Some(_) => {
                slot.cached = None;
                None
            }
            None => None,
        }
    }

    /// Generation to pass to [`BalanceCache::put`]; read it before the
    /// store lookup.
    pub fn generation(&self, user: &UserId) -> u64 {
        self.entries
            .lock()
            .get(user)
            .map_or(0, |slot| slot.generation)
    }

    /// Cache `amount` unless `user` was invalidated after `generation` was read.
    pub fn put(&self, user: UserId, amount: Amount, generation: u64) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock();
        let slot = entries.entry(user).or_default();
        if slot.generation == generation {
            slot.cached = Some((amount, Instant::now()));
        }
    }

    pub fn invalidate(&self, user: &UserId) {
        let mut entries = self.entries.lock();
        let slot = entries.entry(user.clone()).or_default();
        slot.generation = slot.generation.wrapping_add(1);
        slot.cached = None;
    }

    /// Number of cached balances.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|slot| slot.cached.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
