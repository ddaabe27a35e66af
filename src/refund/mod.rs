//! Refund protocol engine.
//!
//! One protocol serves every rental variant, parameterized by the variant's
//! reference namespace and pricing. The sequence for a refund request is:
//!
//! 1. Derive the idempotency reference `<variant>_refund_<user>_<session>`.
//! 2. Load the session. A missing row goes to emergency recovery, which
//!    refunds only against a matching charge found in the user's history.
//! 3. Refuse if the claim flag is set, the session completed, or it has not
//!    expired. Waiting sessions are also checked against ledger history.
//! 4. Resolve the amount from pricing, capped at the original charge.
//! 5. Commit claim + expiry + credit + refund transaction as one
//!    [`WriteBatch`], so a refunded session can never complete later.
//!
//! Concurrent callers race on the claim and on the unique reference; the
//! losers observe [`RefundStatus::AlreadyProcessed`]. Any unexpected error
//! leaves nothing applied and yields [`RefundStatus::Failed`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::Amount;
use crate::ledger::Ledger;
use crate::model::{
    RentalSession, SessionId, SessionStatus, Transaction, TransactionDraft, TransactionKind,
    UserId, Variant,
};
use crate::pricing::Pricing;
use crate::retry::RetryPolicy;
use crate::store::{StoreError, WriteBatch};

pub mod evidence;

mod outcome;
pub use outcome::{IneligibleReason, RefundOutcome, RefundStatus};

/// Applies refunds for expired or failed rentals.
pub struct RefundEngine {
    ledger: Arc<Ledger>,
    pricing: Pricing,
    retry: RetryPolicy,
}

/// Public API
impl RefundEngine {
    pub fn new(ledger: Arc<Ledger>, pricing: Pricing, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            pricing,
            retry,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Refund `session` of `variant` to `user`.
    ///
    /// Safe to call any number of times and concurrently: at most one call
    /// per session credits the balance.
    pub async fn refund(
        &self,
        variant: Variant,
        user: &UserId,
        session: &SessionId,
        reason: &str,
    ) -> RefundOutcome {
        let reference = variant.refund_reference(user, session);
        let outcome = match self
            .try_refund(variant, user, session, reason, &reference)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    variant = %variant,
                    user = %user,
                    session = %session,
                    reason = %err,
                    "refund failed, nothing applied"
                );
                return RefundOutcome::failed(format!("refund failed: {err}"));
            }
        };
        Self::log_outcome(variant, user, session, &outcome);
        outcome
    }
}

/// Private API
impl RefundEngine {
    fn log_outcome(variant: Variant, user: &UserId, session: &SessionId, outcome: &RefundOutcome) {
        match outcome.status {
            RefundStatus::Refunded => info!(
                variant = %variant,
                user = %user,
                session = %session,
                amount = %outcome.amount,
                "refund applied"
            ),
            RefundStatus::AlreadyProcessed => debug!(
                variant = %variant,
                user = %user,
                session = %session,
                "refund already processed"
            ),
            RefundStatus::Ineligible(reason) => debug!(
                variant = %variant,
                user = %user,
                session = %session,
                reason = %reason,
                "refund skipped"
            ),
            RefundStatus::NotFound => warn!(
                variant = %variant,
                user = %user,
                session = %session,
                "refund requested for unknown session without charge evidence"
            ),
            RefundStatus::Failed => {}
        }
    }

    async fn try_refund(
        &self,
        variant: Variant,
        user: &UserId,
        session: &SessionId,
        reason: &str,
        reference: &str,
    ) -> Result<RefundOutcome, StoreError> {
        let store = self.ledger.store();
        let row = self
            .retry
            .retry_if(|_| store.session(variant, session), StoreError::is_transient)
            .await?;
        match row {
            Some(row) => self.refund_session(row, user, reason, reference).await,
            None => {
                self.recover_orphan(variant, user, session, reason, reference)
                    .await
            }
        }
    }

    async fn refund_session(
        &self,
        row: RentalSession,
        user: &UserId,
        reason: &str,
        reference: &str,
    ) -> Result<RefundOutcome, StoreError> {
        let now = Utc::now();
        if &row.user != user {
            return Ok(RefundOutcome::ineligible(IneligibleReason::WrongOwner));
        }
        if row.refund_processed {
            return Ok(RefundOutcome::already_processed());
        }
        if row.status == SessionStatus::Completed {
            return Ok(RefundOutcome::ineligible(IneligibleReason::Completed));
        }
        if !row.is_expired_at(now) {
            return Ok(RefundOutcome::ineligible(IneligibleReason::NotExpired));
        }

        let history = self.history(user).await?;
        if row.status == SessionStatus::Waiting
            && evidence::existing_refund(&history, row.variant, reference, &row.id).is_some()
        {
            self.settle_prior_refund(row.variant, &row.id, now).await;
            return Ok(RefundOutcome::already_processed());
        }

        let charge = evidence::original_charge(&history, row.variant, user, &row.id);
        let cap = charge.map(|tx| tx.amount.abs()).unwrap_or(row.cost);
        let amount = self.pricing.resolve(row.variant, &row.service).await.min(cap);
        if !amount.is_positive() {
            return Ok(RefundOutcome::ineligible(IneligibleReason::NothingCharged));
        }

        let draft = refund_draft(row.variant, user, &row.id, amount, reference, reason);
        let batch = WriteBatch::new()
            .claim_refund(row.variant, row.id.clone(), now)
            .expire_session(row.variant, row.id.clone(), now)
            .credit(user.clone(), amount)
            .insert_transaction(draft);
        self.commit_refund(batch, amount, "refund applied").await
    }

    /// Refund a session whose row no longer exists, using the original
    /// charge as both evidence and upper bound. There is no row to claim;
    /// the unique reference alone prevents a second refund.
    async fn recover_orphan(
        &self,
        variant: Variant,
        user: &UserId,
        session: &SessionId,
        reason: &str,
        reference: &str,
    ) -> Result<RefundOutcome, StoreError> {
        let history = self.history(user).await?;
        if evidence::existing_refund(&history, variant, reference, session).is_some() {
            return Ok(RefundOutcome::already_processed());
        }
        let Some(charge) = evidence::original_charge(&history, variant, user, session) else {
            return Ok(RefundOutcome::not_found());
        };
        let amount = charge.amount.abs();
        if !amount.is_positive() {
            return Ok(RefundOutcome::not_found());
        }
        warn!(
            variant = %variant,
            user = %user,
            session = %session,
            charge = charge.id,
            amount = %amount,
            "session missing, recovering refund from charge record"
        );
        let draft = refund_draft(variant, user, session, amount, reference, reason);
        let batch = WriteBatch::new()
            .credit(user.clone(), amount)
            .insert_transaction(draft);
        self.commit_refund(batch, amount, "refund recovered from charge record")
            .await
    }

    /// Commit a refund batch, mapping claim and reference conflicts to
    /// "already processed". Without claim storage the batch is retried
    /// with the reference constraint as the only guard.
    async fn commit_refund(
        &self,
        batch: WriteBatch,
        amount: Amount,
        message: &str,
    ) -> Result<RefundOutcome, StoreError> {
        let result = match self.commit_with_retry(&batch).await {
            Err(StoreError::SchemaUnavailable) => {
                info!("refund claim storage unavailable, using reference check only");
                self.commit_with_retry(&batch.without_claims()).await
            }
            other => other,
        };
        match result {
            Ok(receipt) => {
                let tx = receipt.transactions.first().ok_or_else(|| {
                    StoreError::Unavailable("commit returned no transaction".to_string())
                })?;
                Ok(RefundOutcome::refunded(amount, tx.id, message))
            }
            Err(StoreError::ClaimConflict(_)) | Err(StoreError::DuplicateReference(_)) => {
                Ok(RefundOutcome::already_processed())
            }
            Err(StoreError::SessionCompleted(_)) => {
                Ok(RefundOutcome::ineligible(IneligibleReason::Completed))
            }
            Err(err) => Err(err),
        }
    }

    async fn commit_with_retry(
        &self,
        batch: &WriteBatch,
    ) -> Result<crate::store::CommitReceipt, StoreError> {
        self.retry
            .retry_if(|_| self.ledger.commit(batch.clone()), StoreError::is_transient)
            .await
    }

    async fn history(&self, user: &UserId) -> Result<Vec<Transaction>, StoreError> {
        let store = self.ledger.store();
        self.retry
            .retry_if(|_| store.transactions(user), StoreError::is_transient)
            .await
    }

    /// Set the claim flag and close a session refunded before the flag
    /// existed. Best effort; the claim is dropped on stores without it.
    async fn settle_prior_refund(&self, variant: Variant, session: &SessionId, at: DateTime<Utc>) {
        let batch = WriteBatch::new()
            .claim_refund(variant, session.clone(), at)
            .expire_session(variant, session.clone(), at);
        let result = match self.ledger.commit(batch.clone()).await {
            Err(StoreError::SchemaUnavailable) => self.ledger.commit(batch.without_claims()).await,
            other => other,
        };
        match result {
            Ok(_) => debug!(variant = %variant, session = %session, "prior refund settled"),
            Err(err) => debug!(
                variant = %variant,
                session = %session,
                reason = %err,
                "prior refund settlement skipped"
            ),
        }
    }
}

fn refund_draft(
    variant: Variant,
    user: &UserId,
    session: &SessionId,
    amount: Amount,
    reference: &str,
    reason: &str,
) -> TransactionDraft {
    TransactionDraft::new(
        user.clone(),
        TransactionKind::Refund,
        amount,
        reference,
        format!("{variant} refund for session {session}: {reason}"),
    )
}
