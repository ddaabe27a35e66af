use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CommitReceipt, ScanWindow, Store, StoreError, WriteBatch, WriteOp};
use crate::Amount;
use crate::model::{
    BalanceChange, RentalSession, SessionId, SessionStatus, Transaction, TransactionDraft, TxId,
    UserId, Variant,
};

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<(Variant, SessionId), RentalSession>,
    balances: HashMap<UserId, Amount>,
    /// Append-only log, commit order
    transactions: Vec<Transaction>,
    /// Unique reference index into `transactions`
    by_reference: HashMap<String, usize>,
}

/// A validated balance adjustment awaiting its transaction.
#[derive(Debug)]
struct Adjustment {
    user: UserId,
    delta: Amount,
    change: BalanceChange,
    paired: bool,
}

impl State {
    fn balance(&self, user: &UserId) -> Amount {
        self.balances.get(user).copied().unwrap_or_default()
    }

    fn next_tx_id(&self) -> TxId {
        self.transactions.len() as TxId + 1
    }
}

/// In-process [`Store`] holding everything behind one lock.
///
/// Every call takes the lock once and never awaits while holding it, so a
/// [`WriteBatch`] is trivially atomic. Test knobs simulate a store whose
/// claim column is not migrated and transient write/lookup failures.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    claim_schema: AtomicBool,
    failing_commits: AtomicUsize,
    failing_lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            claim_schema: AtomicBool::new(true),
            failing_commits: AtomicUsize::new(0),
            failing_lookups: AtomicUsize::new(0),
        }
    }

    /// A store that predates the refund claim flag.
    pub fn legacy() -> Self {
        let store = Self::new();
        store.claim_schema.store(false, Ordering::SeqCst);
        store
    }

    /// Insert a session directly, bypassing the charge path.
    pub fn seed_session(&self, session: RentalSession) {
        self.state
            .lock()
            .sessions
            .insert((session.variant, session.id.clone()), session);
    }

    /// Make the next `n` commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` session lookups fail with [`StoreError::Unavailable`].
    pub fn fail_next_lookups(&self, n: usize) {
        self.failing_lookups.store(n, Ordering::SeqCst);
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    /// Every user with a balance row, sorted.
    pub fn balances(&self) -> Vec<(UserId, Amount)> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .balances
            .iter()
            .map(|(user, amount)| (user.clone(), *amount))
            .collect();
        rows.sort();
        rows
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Balances of a draft: supplied ones win, otherwise the draft takes
    /// the first unpaired adjustment of the same user and amount.
    fn resolve_balances(
        draft: &TransactionDraft,
        adjustments: &mut [Adjustment],
    ) -> Result<(Amount, Amount), StoreError> {
        let overflow = || StoreError::Overflow(draft.user.clone());
        match (draft.balance_before, draft.balance_after) {
            (Some(before), Some(after)) => Ok((before, after)),
            (Some(before), None) => {
                let after = before.checked_add(draft.amount).ok_or_else(overflow)?;
                Ok((before, after))
            }
            (None, Some(after)) => {
                let before = after.checked_sub(draft.amount).ok_or_else(overflow)?;
                Ok((before, after))
            }
            (None, None) => {
                let adjustment = adjustments
                    .iter_mut()
                    .find(|a| !a.paired && a.user == draft.user && a.delta == draft.amount)
                    .ok_or_else(|| StoreError::UnpairedTransaction(draft.reference.clone()))?;
                adjustment.paired = true;
                Ok((adjustment.change.before, adjustment.change.after))
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn session(
        &self,
        variant: Variant,
        id: &SessionId,
    ) -> Result<Option<RentalSession>, StoreError> {
        if Self::take_fault(&self.failing_lookups) {
            return Err(StoreError::Unavailable("injected lookup failure".to_string()));
        }
        Ok(self.state.lock().sessions.get(&(variant, id.clone())).cloned())
    }

    async fn refund_candidates(
        &self,
        variant: Variant,
        window: ScanWindow,
        limit: usize,
    ) -> Result<Vec<RentalSession>, StoreError> {
        let state = self.state.lock();
        let mut candidates: Vec<_> = state
            .sessions
            .values()
            .filter(|s| {
                s.variant == variant
                    && !s.refund_processed
                    && s.status != SessionStatus::Completed
                    && window.contains(s.expires_at)
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn claim_refund(
        &self,
        variant: Variant,
        id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !self.claim_schema.load(Ordering::SeqCst) {
            return Err(StoreError::SchemaUnavailable);
        }
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&(variant, id.clone()))
            .ok_or_else(|| StoreError::SessionNotFound(id.clone()))?;
        if session.refund_processed {
            return Ok(false);
        }
        session.refund_processed = true;
        session.refund_processed_at = Some(at);
        Ok(true)
    }

    async fn close_session(
        &self,
        variant: Variant,
        id: &SessionId,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&(variant, id.clone()))
            .ok_or_else(|| StoreError::SessionNotFound(id.clone()))?;
        if session.status != SessionStatus::Waiting || !status.is_terminal() {
            return Ok(false);
        }
        match status {
            SessionStatus::Completed if session.refund_processed => return Ok(false),
            SessionStatus::Expired => session.expire(at),
            _ => {
                session.status = status;
                session.closed_at = Some(at);
            }
        }
        Ok(true)
    }

    async fn balance(&self, user: &UserId) -> Result<Amount, StoreError> {
        Ok(self.state.lock().balance(user))
    }

    async fn transactions(&self, user: &UserId) -> Result<Vec<Transaction>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .iter()
            .filter(|tx| &tx.user == user)
            .cloned()
            .collect())
    }

    async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .by_reference
            .get(reference)
            .map(|&idx| state.transactions[idx].clone()))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        if Self::take_fault(&self.failing_commits) {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        let claim_schema = self.claim_schema.load(Ordering::SeqCst);
        let mut state = self.state.lock();
        let now = Utc::now();

        // Validate everything against a projection first; nothing below
        // mutates `state` until the whole batch is known to apply.
        let mut projected: HashMap<UserId, Amount> = HashMap::new();
        let mut claims: Vec<((Variant, SessionId), DateTime<Utc>)> = Vec::new();
        let mut expirations: Vec<((Variant, SessionId), DateTime<Utc>)> = Vec::new();
        let mut new_session_keys: HashSet<(Variant, &SessionId)> = HashSet::new();
        let mut new_sessions: Vec<RentalSession> = Vec::new();
        let mut adjustments: Vec<Adjustment> = Vec::new();
        let mut drafts: Vec<&TransactionDraft> = Vec::new();
        let mut receipt = CommitReceipt::default();

        for op in batch.ops() {
            match op {
                WriteOp::ClaimRefund {
                    variant,
                    session,
                    at,
                } => {
                    if !claim_schema {
                        return Err(StoreError::SchemaUnavailable);
                    }
                    let key = (*variant, session.clone());
                    let row = state
                        .sessions
                        .get(&key)
                        .ok_or_else(|| StoreError::SessionNotFound(session.clone()))?;
                    if row.refund_processed || claims.iter().any(|(claimed, _)| *claimed == key) {
                        return Err(StoreError::ClaimConflict(session.clone()));
                    }
                    claims.push((key, *at));
                }
                WriteOp::ExpireSession {
                    variant,
                    session,
                    at,
                } => {
                    let key = (*variant, session.clone());
                    let row = state
                        .sessions
                        .get(&key)
                        .ok_or_else(|| StoreError::SessionNotFound(session.clone()))?;
                    match row.status {
                        SessionStatus::Completed => {
                            return Err(StoreError::SessionCompleted(session.clone()));
                        }
                        SessionStatus::Waiting => expirations.push((key, *at)),
                        SessionStatus::Expired => {}
                    }
                }
                WriteOp::AdjustBalance {
                    user,
                    delta,
                    floor_at_zero,
                } => {
                    let before = projected
                        .get(user)
                        .copied()
                        .unwrap_or_else(|| state.balance(user));
                    let after = before
                        .checked_add(*delta)
                        .ok_or_else(|| StoreError::Overflow(user.clone()))?;
                    if *floor_at_zero && after < Amount::ZERO {
                        return Err(StoreError::InsufficientFunds {
                            user: user.clone(),
                            balance: before,
                            requested: -*delta,
                        });
                    }
                    let change = BalanceChange { before, after };
                    projected.insert(user.clone(), after);
                    receipt.balances.push((user.clone(), change));
                    adjustments.push(Adjustment {
                        user: user.clone(),
                        delta: *delta,
                        change,
                        paired: false,
                    });
                }
                WriteOp::InsertTransaction(draft) => drafts.push(draft),
                WriteOp::InsertSession(session) => {
                    let key = (session.variant, session.id.clone());
                    if state.sessions.contains_key(&key)
                        || !new_session_keys.insert((session.variant, &session.id))
                    {
                        return Err(StoreError::SessionExists(session.id.clone()));
                    }
                    new_sessions.push(session.clone());
                }
            }
        }

        let mut next_id = state.next_tx_id();
        for draft in drafts {
            if let Some(&idx) = state.by_reference.get(&draft.reference) {
                return Err(StoreError::DuplicateReference(Box::new(
                    state.transactions[idx].clone(),
                )));
            }
            if let Some(earlier) = receipt
                .transactions
                .iter()
                .find(|tx| tx.reference == draft.reference)
            {
                return Err(StoreError::DuplicateReference(Box::new(earlier.clone())));
            }
            let (balance_before, balance_after) = Self::resolve_balances(draft, &mut adjustments)?;
            receipt.transactions.push(Transaction {
                id: next_id,
                user: draft.user.clone(),
                kind: draft.kind,
                amount: draft.amount,
                reference: draft.reference.clone(),
                description: draft.description.clone(),
                balance_before,
                balance_after,
                status: draft.status,
                created_at: now,
            });
            next_id += 1;
        }

        // Apply
        for (key, at) in claims {
            if let Some(session) = state.sessions.get_mut(&key) {
                session.refund_processed = true;
                session.refund_processed_at = Some(at);
            }
        }
        for (key, at) in expirations {
            if let Some(session) = state.sessions.get_mut(&key) {
                session.expire(at);
            }
        }
        for (user, after) in projected {
            state.balances.insert(user, after);
        }
        for session in new_sessions {
            state
                .sessions
                .insert((session.variant, session.id.clone()), session);
        }
        for tx in &receipt.transactions {
            let idx = state.transactions.len();
            state.by_reference.insert(tx.reference.clone(), idx);
            state.transactions.push(tx.clone());
        }

        Ok(receipt)
    }
}
