//! Persistence contract for sessions, balances and the transaction log.
//!
//! The storage engine itself lives outside this crate. What the refund
//! protocol needs from it is captured by [`Store`]:
//!
//! - point lookups and bounded scans of rental sessions,
//! - conditional (compare-and-swap) updates of the refund claim flag and
//!   session status, where "zero rows matched" is reported distinctly,
//! - an atomic [`WriteBatch`] that applies a claim, balance adjustments and
//!   transaction inserts together or not at all,
//! - a unique constraint on transaction references.
//!
//! [`MemoryStore`] is a reference implementation of the contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Amount;
use crate::model::{
    BalanceChange, RentalSession, SessionId, SessionStatus, Transaction, TransactionDraft, UserId,
    Variant,
};

mod error;
pub use error::StoreError;

mod memory;
pub use memory::MemoryStore;

/// Expiry window of a candidate scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    /// Exclusive lower bound on `expires_at`; `None` scans everything.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `expires_at`.
    pub until: DateTime<Utc>,
}

impl ScanWindow {
    pub fn full(until: DateTime<Utc>) -> Self {
        Self { since: None, until }
    }

    pub fn incremental(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            until,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at <= self.until && self.since.is_none_or(|since| at > since)
    }
}

/// One operation of an atomic [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Set `refund_processed` false→true; fails with
    /// [`StoreError::ClaimConflict`] when already set.
    ClaimRefund {
        variant: Variant,
        session: SessionId,
        at: DateTime<Utc>,
    },
    /// Add `delta` to the user's balance. With `floor_at_zero` the update
    /// is conditional on the result staying non-negative.
    AdjustBalance {
        user: UserId,
        delta: Amount,
        floor_at_zero: bool,
    },
    /// Move a waiting session to `Expired`, clamping `expires_at` to `at`.
    /// A session that is already expired is left alone; a completed one
    /// fails the batch with [`StoreError::SessionCompleted`].
    ExpireSession {
        variant: Variant,
        session: SessionId,
        at: DateTime<Utc>,
    },
    /// Insert a transaction; the reference must be unique.
    ///
    /// A draft without balances takes them from an `AdjustBalance` of the
    /// same user and amount in the same batch, wherever it sits. Without
    /// one the batch fails with [`StoreError::UnpairedTransaction`].
    InsertTransaction(TransactionDraft),
    /// Insert a new session; the id must be unique.
    InsertSession(RentalSession),
}

/// Operations applied all-or-nothing.
///
/// Adjustments to one user apply in batch order. Transactions are paired
/// with their adjustment by user and amount, so their position relative
/// to it does not matter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim_refund(mut self, variant: Variant, session: SessionId, at: DateTime<Utc>) -> Self {
        self.ops.push(WriteOp::ClaimRefund {
            variant,
            session,
            at,
        });
        self
    }

    pub fn credit(mut self, user: UserId, amount: Amount) -> Self {
        self.ops.push(WriteOp::AdjustBalance {
            user,
            delta: amount,
            floor_at_zero: false,
        });
        self
    }

    pub fn debit(mut self, user: UserId, amount: Amount) -> Self {
        self.ops.push(WriteOp::AdjustBalance {
            user,
            delta: -amount,
            floor_at_zero: true,
        });
        self
    }

    pub fn expire_session(mut self, variant: Variant, session: SessionId, at: DateTime<Utc>) -> Self {
        self.ops.push(WriteOp::ExpireSession {
            variant,
            session,
            at,
        });
        self
    }

    pub fn insert_transaction(mut self, draft: TransactionDraft) -> Self {
        self.ops.push(WriteOp::InsertTransaction(draft));
        self
    }

    pub fn insert_session(mut self, session: RentalSession) -> Self {
        self.ops.push(WriteOp::InsertSession(session));
        self
    }

    /// Drop claim operations, leaving the reference constraint as the only
    /// idempotency guard. Used against stores without a claim column.
    pub fn without_claims(mut self) -> Self {
        self.ops
            .retain(|op| !matches!(op, WriteOp::ClaimRefund { .. }));
        self
    }

    pub fn has_claim(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, WriteOp::ClaimRefund { .. }))
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// What a committed batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// One entry per `AdjustBalance`, in batch order.
    pub balances: Vec<(UserId, BalanceChange)>,
    /// One entry per `InsertTransaction`, in batch order.
    pub transactions: Vec<Transaction>,
}

/// Storage backend for sessions, balances and transactions.
///
/// Sessions are keyed by variant and id: every variant is its own
/// namespace, so equal id strings in two variants are unrelated rows.
///
/// Implementations must provide bounded latency; none of these calls may
/// block indefinitely.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn session(
        &self,
        variant: Variant,
        id: &SessionId,
    ) -> Result<Option<RentalSession>, StoreError>;

    /// Unclaimed, not-completed sessions of `variant` whose expiry falls in
    /// `window`, oldest expiry first, at most `limit`.
    async fn refund_candidates(
        &self,
        variant: Variant,
        window: ScanWindow,
        limit: usize,
    ) -> Result<Vec<RentalSession>, StoreError>;

    /// Standalone claim CAS. `Ok(false)` means the flag was already set.
    async fn claim_refund(
        &self,
        variant: Variant,
        id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Move a waiting session to a terminal status. `Ok(false)` means the
    /// session was not waiting, or that it was refunded and `status` is
    /// `Completed`. Closing as expired clamps `expires_at` to `at`.
    async fn close_session(
        &self,
        variant: Variant,
        id: &SessionId,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn balance(&self, user: &UserId) -> Result<Amount, StoreError>;

    /// The user's transactions in commit order.
    async fn transactions(&self, user: &UserId) -> Result<Vec<Transaction>, StoreError>;

    async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Apply every operation of `batch` atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn scan_window_bounds() {
        let now = Utc::now();
        let full = ScanWindow::full(now);
        assert!(full.contains(now - Duration::days(30)));
        assert!(full.contains(now));
        assert!(!full.contains(now + Duration::seconds(1)));

        let inc = ScanWindow::incremental(now - Duration::seconds(10), now);
        assert!(!inc.contains(now - Duration::seconds(10)));
        assert!(inc.contains(now - Duration::seconds(9)));
        assert!(!inc.contains(now - Duration::seconds(11)));
    }

    #[test]
    fn without_claims_keeps_other_ops() {
        let batch = WriteBatch::new()
            .claim_refund(Variant::Sms, SessionId::from("S1"), Utc::now())
            .credit(UserId::from("u1"), Amount::from_minor(100));
        assert!(batch.has_claim());

        let batch = batch.expire_session(Variant::Sms, SessionId::from("S1"), Utc::now());
        let legacy = batch.without_claims();
        assert!(!legacy.has_claim());
        assert_eq!(legacy.ops().len(), 2);
    }
}
