//! Billing ledger.
//!
//! The ledger owns user balances and the append-only transaction log. Every
//! balance mutation goes through the store's atomic conditional update and
//! is recorded together with exactly one transaction. Callers never
//! read-modify-write a balance.

use std::sync::Arc;

use tracing::{debug, info};

use crate::Amount;
use crate::config::LedgerConfig;
use crate::model::{
    BalanceChange, RentalSession, Transaction, TransactionDraft, TransactionKind, UserId,
};
use crate::store::{CommitReceipt, Store, StoreError, WriteBatch, WriteOp};

mod cache;
pub use cache::BalanceCache;

mod error;
pub use error::LedgerError;

/// Balance and transaction log facade over a [`Store`].
pub struct Ledger {
    store: Arc<dyn Store>,
    cache: BalanceCache,
}

/// Public API
impl Ledger {
    pub fn new(store: Arc<dyn Store>, config: &LedgerConfig) -> Self {
        Self {
            store,
            cache: BalanceCache::new(config.balance_cache_ttl()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Current balance, served from a short-lived cache.
    pub async fn balance(&self, user: &UserId) -> Result<Amount, LedgerError> {
        if let Some(amount) = self.cache.get(user) {
            return Ok(amount);
        }
        let generation = self.cache.generation(user);
        let amount = self.store.balance(user).await?;
        self.cache.put(user.clone(), amount, generation);
        Ok(amount)
    }

    /// Atomically add `delta` to the balance.
    ///
    /// Negative deltas are conditional on the balance staying non-negative
    /// and fail with [`LedgerError::InsufficientFunds`] otherwise.
    ///
    /// This records no transaction, and following it with
    /// [`Ledger::create_transaction`] is not atomic. Use [`Ledger::commit`]
    /// with the adjustment and its transaction in one batch.
    pub async fn increment_balance(
        &self,
        user: &UserId,
        delta: Amount,
    ) -> Result<BalanceChange, LedgerError> {
        let batch = if delta < Amount::ZERO {
            WriteBatch::new().debit(user.clone(), -delta)
        } else {
            WriteBatch::new().credit(user.clone(), delta)
        };
        let receipt = self.commit(batch).await?;
        receipt
            .balances
            .into_iter()
            .next()
            .map(|(_, change)| change)
            .ok_or_else(|| {
                LedgerError::Store(StoreError::Unavailable(
                    "commit returned no balance change".to_string(),
                ))
            })
    }

    /// Insert a transaction, idempotently on its reference.
    ///
    /// A reference that is already recorded returns the existing record;
    /// nothing new is written. The draft must carry its balances: without
    /// a balance adjustment in the same batch there is nothing to compute
    /// them from, and the store rejects it.
    pub async fn create_transaction(
        &self,
        draft: TransactionDraft,
    ) -> Result<Transaction, LedgerError> {
        let reference = draft.reference.clone();
        match self
            .commit(WriteBatch::new().insert_transaction(draft))
            .await
        {
            Ok(receipt) => first_transaction(receipt),
            Err(StoreError::DuplicateReference(existing)) => {
                debug!(reference = %reference, id = existing.id, "transaction already recorded");
                Ok(*existing)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Credit `amount` to `user`, idempotently on `reference`.
    pub async fn deposit(
        &self,
        user: &UserId,
        amount: Amount,
        reference: impl Into<String>,
    ) -> Result<Transaction, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let reference = reference.into();
        let draft = TransactionDraft::new(
            user.clone(),
            TransactionKind::Deposit,
            amount,
            reference.clone(),
            format!("deposit {reference}"),
        );
        let batch = WriteBatch::new()
            .credit(user.clone(), amount)
            .insert_transaction(draft);
        let tx = self.commit_idempotent(batch).await?;
        info!(user = %user, amount = %amount, balance = %tx.balance_after, "deposit applied");
        Ok(tx)
    }

    /// Debit the session cost and open the session, atomically.
    ///
    /// Repeating a charge for the same session returns the original charge.
    pub async fn charge(&self, session: RentalSession) -> Result<Transaction, LedgerError> {
        if !session.cost.is_positive() {
            return Err(LedgerError::InvalidAmount(session.cost));
        }
        let user = session.user.clone();
        let cost = session.cost;
        let reference = session.variant.charge_reference(&user, &session.id);
        if let Some(existing) = self.store.transaction_by_reference(&reference).await? {
            return Ok(existing);
        }
        let draft = TransactionDraft::new(
            user.clone(),
            TransactionKind::Charge,
            -cost,
            reference,
            format!(
                "{} number for session {} ({})",
                session.variant, session.id, session.service
            ),
        );
        let session_id = session.id.clone();
        let batch = WriteBatch::new()
            .debit(user.clone(), cost)
            .insert_transaction(draft)
            .insert_session(session);
        let tx = self.commit_idempotent(batch).await?;
        info!(
            user = %user,
            session = %session_id,
            amount = %cost,
            balance = %tx.balance_after,
            "charge applied"
        );
        Ok(tx)
    }

    /// Apply `batch` atomically and invalidate every touched balance.
    pub async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        let touched: Vec<UserId> = batch
            .ops()
            .iter()
            .filter_map(|op| match op {
                WriteOp::AdjustBalance { user, .. } => Some(user.clone()),
                _ => None,
            })
            .collect();
        let result = self.store.commit(batch).await;
        // Invalidate even on error: a transient failure may hide a commit.
        for user in &touched {
            self.cache.invalidate(user);
        }
        result
    }

    /// The user's transactions in commit order.
    pub async fn transactions(&self, user: &UserId) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.store.transactions(user).await?)
    }

    pub async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        Ok(self.store.transaction_by_reference(reference).await?)
    }
}

/// Private API
impl Ledger {
    /// Commit a batch carrying one transaction; a duplicate reference
    /// resolves to the already-recorded transaction.
    async fn commit_idempotent(&self, batch: WriteBatch) -> Result<Transaction, LedgerError> {
        match self.commit(batch).await {
            Ok(receipt) => first_transaction(receipt),
            Err(StoreError::DuplicateReference(existing)) => {
                debug!(
                    reference = %existing.reference,
                    id = existing.id,
                    "duplicate request resolved to existing transaction"
                );
                Ok(*existing)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn first_transaction(receipt: CommitReceipt) -> Result<Transaction, LedgerError> {
    receipt.transactions.into_iter().next().ok_or_else(|| {
        LedgerError::Store(StoreError::Unavailable(
            "commit returned no transaction".to_string(),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionId, SessionStatus, Variant};
    use crate::store::{MemoryStore, ScanWindow};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use tokio::sync::Notify;

    fn ledger() -> (Arc<MemoryStore>, Ledger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), &LedgerConfig::default());
        (store, ledger)
    }

    fn session(id: &str, cost: i64) -> RentalSession {
        RentalSession::new(
            id,
            "u1",
            Variant::Sms,
            "whatsapp",
            Amount::from_minor(cost),
            Utc::now() + Duration::minutes(10),
        )
    }

    fn u1() -> UserId {
        UserId::from("u1")
    }

    #[tokio::test]
    async fn deposit_increases_balance_and_records_transaction() {
        let (_, ledger) = ledger();
        let tx = ledger.deposit(&u1(), Amount::from_minor(5000), "dep-1").await.unwrap();

        assert_eq!(tx.kind, TransactionKind::Deposit);
        assert_eq!(tx.balance_before, Amount::ZERO);
        assert_eq!(tx.balance_after, Amount::from_minor(5000));
        assert_eq!(ledger.balance(&u1()).await.unwrap(), Amount::from_minor(5000));
    }

    #[tokio::test]
    async fn deposit_is_idempotent_on_reference() {
        let (store, ledger) = ledger();
        let first = ledger.deposit(&u1(), Amount::from_minor(5000), "dep-1").await.unwrap();
        let second = ledger.deposit(&u1(), Amount::from_minor(5000), "dep-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(ledger.balance(&u1()).await.unwrap(), Amount::from_minor(5000));
    }

    #[tokio::test]
    async fn deposit_rejects_non_positive_amount() {
        let (_, ledger) = ledger();
        let result = ledger.deposit(&u1(), Amount::ZERO, "dep-0").await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn charge_debits_and_opens_session() {
        let (store, ledger) = ledger();
        ledger.deposit(&u1(), Amount::from_minor(5000), "dep-1").await.unwrap();
        let tx = ledger.charge(session("S1", 2100)).await.unwrap();

        assert_eq!(tx.amount, Amount::from_minor(-2100));
        assert_eq!(tx.reference, "sms_charge_u1_S1");
        assert_eq!(ledger.balance(&u1()).await.unwrap(), Amount::from_minor(2900));
        assert!(store.session(Variant::Sms, &SessionId::from("S1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn charge_with_insufficient_funds_is_typed_and_applies_nothing() {
        let (store, ledger) = ledger();
        ledger.deposit(&u1(), Amount::from_minor(1000), "dep-1").await.unwrap();
        let result = ledger.charge(session("S1", 2100)).await;

        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
        assert_eq!(ledger.balance(&u1()).await.unwrap(), Amount::from_minor(1000));
        assert!(store.session(Variant::Sms, &SessionId::from("S1")).await.unwrap().is_none());
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn repeated_charge_returns_original() {
        let (store, ledger) = ledger();
        ledger.deposit(&u1(), Amount::from_minor(5000), "dep-1").await.unwrap();
        let first = ledger.charge(session("S1", 2100)).await.unwrap();
        let again = ledger.charge(session("S1", 2100)).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(store.transaction_count(), 2);
        assert_eq!(ledger.balance(&u1()).await.unwrap(), Amount::from_minor(2900));
    }

    #[tokio::test]
    async fn create_transaction_without_balances_is_rejected() {
        let (store, ledger) = ledger();
        ledger.deposit(&u1(), Amount::from_minor(500), "dep-1").await.unwrap();

        let result = ledger
            .create_transaction(TransactionDraft::new(
                u1(),
                TransactionKind::Deposit,
                Amount::from_minor(700),
                "note-1",
                "manual credit",
            ))
            .await;

        assert!(matches!(
            result,
            Err(LedgerError::Store(StoreError::UnpairedTransaction(_)))
        ));
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn adjustment_and_transaction_in_one_commit_keep_chain() {
        let (_, ledger) = ledger();
        let change = ledger
            .increment_balance(&u1(), Amount::from_minor(300))
            .await
            .unwrap();
        assert_eq!(change.before, Amount::ZERO);
        assert_eq!(change.after, Amount::from_minor(300));

        let receipt = ledger
            .commit(
                WriteBatch::new()
                    .credit(u1(), Amount::from_minor(700))
                    .insert_transaction(TransactionDraft::new(
                        u1(),
                        TransactionKind::Deposit,
                        Amount::from_minor(700),
                        "manual-1",
                        "manual credit",
                    )),
            )
            .await
            .unwrap();
        let tx = &receipt.transactions[0];
        assert_eq!(tx.balance_before, Amount::from_minor(300));
        assert_eq!(tx.balance_after, Amount::from_minor(1000));
    }

    #[tokio::test]
    async fn create_transaction_keeps_supplied_balances() {
        let (_, ledger) = ledger();
        let draft = TransactionDraft::new(
            u1(),
            TransactionKind::Deposit,
            Amount::from_minor(10),
            "manual-2",
            "manual credit",
        )
        .with_balances(Amount::from_minor(90), Amount::from_minor(100));

        let tx = ledger.create_transaction(draft.clone()).await.unwrap();
        assert_eq!(tx.balance_before, Amount::from_minor(90));
        assert_eq!(tx.balance_after, Amount::from_minor(100));

        let again = ledger.create_transaction(draft).await.unwrap();
        assert_eq!(again.id, tx.id);
    }

    #[tokio::test]
    async fn negative_increment_cannot_overdraw() {
        let (_, ledger) = ledger();
        let result = ledger
            .increment_balance(&u1(), Amount::from_minor(-1))
            .await;
        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
    }

    #[tokio::test]
    async fn mutation_invalidates_cached_balance() {
        let (_, ledger) = ledger();
        assert_eq!(ledger.balance(&u1()).await.unwrap(), Amount::ZERO);
        ledger.deposit(&u1(), Amount::from_minor(300), "dep-1").await.unwrap();
        assert_eq!(ledger.balance(&u1()).await.unwrap(), Amount::from_minor(300));
    }

    /// Holds every balance read after it hit the store until released.
    struct GatedBalance {
        inner: MemoryStore,
        read: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Store for GatedBalance {
        async fn session(
            &self,
            variant: Variant,
            id: &SessionId,
        ) -> Result<Option<RentalSession>, StoreError> {
            self.inner.session(variant, id).await
        }

        async fn refund_candidates(
            &self,
            variant: Variant,
            window: ScanWindow,
            limit: usize,
        ) -> Result<Vec<RentalSession>, StoreError> {
            self.inner.refund_candidates(variant, window, limit).await
        }

        async fn claim_refund(
            &self,
            variant: Variant,
            id: &SessionId,
            at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.claim_refund(variant, id, at).await
        }

        async fn close_session(
            &self,
            variant: Variant,
            id: &SessionId,
            status: SessionStatus,
            at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.close_session(variant, id, status, at).await
        }

        async fn balance(&self, user: &UserId) -> Result<Amount, StoreError> {
            let amount = self.inner.balance(user).await?;
            self.read.notify_one();
            self.release.notified().await;
            Ok(amount)
        }

        async fn transactions(&self, user: &UserId) -> Result<Vec<Transaction>, StoreError> {
            self.inner.transactions(user).await
        }

        async fn transaction_by_reference(
            &self,
            reference: &str,
        ) -> Result<Option<Transaction>, StoreError> {
            self.inner.transaction_by_reference(reference).await
        }

        async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
            self.inner.commit(batch).await
        }
    }

    #[tokio::test]
    async fn read_racing_a_deposit_is_not_cached() {
        let store = Arc::new(GatedBalance {
            inner: MemoryStore::new(),
            read: Notify::new(),
            release: Notify::new(),
        });
        let ledger = Ledger::new(store.clone(), &LedgerConfig::default());
        let user = u1();

        let (stale, _) = tokio::join!(ledger.balance(&user), async {
            store.read.notified().await;
            ledger.deposit(&user, Amount::from_minor(500), "dep-1").await.unwrap();
            store.release.notify_one();
        });
        assert_eq!(stale.unwrap(), Amount::ZERO);

        // The next read misses the cache and goes back to the store
        store.release.notify_one();
        assert_eq!(ledger.balance(&user).await.unwrap(), Amount::from_minor(500));
    }

    #[tokio::test]
    async fn transaction_chain_is_contiguous() {
        let (_, ledger) = ledger();
        ledger.deposit(&u1(), Amount::from_minor(5000), "dep-1").await.unwrap();
        ledger.charge(session("S1", 2100)).await.unwrap();
        ledger.charge(session("S2", 900)).await.unwrap();
        ledger.deposit(&u1(), Amount::from_minor(100), "dep-2").await.unwrap();

        let txs = ledger.transactions(&u1()).await.unwrap();
        for tx in &txs {
            assert_eq!(tx.balance_after - tx.balance_before, tx.amount);
        }
        for pair in txs.windows(2) {
            assert_eq!(pair[1].balance_before, pair[0].balance_after);
        }
    }
}
