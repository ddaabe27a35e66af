//! Instant refund trigger.
//!
//! Entry point for code that learns a session has ended before the
//! reconciliation scheduler would notice: provider polls reporting an
//! expiry, or bulk expiry notifications. Every path lands in the same
//! idempotent [`RefundEngine`], so racing the scheduler is harmless.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::TriggerConfig;
use crate::model::{RentalSession, SessionId, SessionStatus, UserId, Variant};
use crate::refund::{RefundEngine, RefundOutcome};
use crate::store::StoreError;

/// One expiry notification for [`InstantTrigger::on_expired_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSession {
    pub variant: Variant,
    pub user: UserId,
    pub session: SessionId,
    pub reason: String,
}

impl ExpiredSession {
    pub fn new(
        variant: Variant,
        user: impl Into<UserId>,
        session: impl Into<SessionId>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            variant,
            user: user.into(),
            session: session.into(),
            reason: reason.into(),
        }
    }
}

/// Result of polling the number provider for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderPoll {
    /// A code arrived; the rental succeeded.
    Completed(String),
    Waiting,
    /// The provider gave up on the number.
    Expired,
    /// The poll itself failed. Treated as transient.
    Error(String),
}

/// What [`InstantTrigger::observe`] did with a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollAction {
    NoAction,
    Completed { code: String, closed: bool },
    Expired(RefundOutcome),
}

pub struct InstantTrigger {
    engine: Arc<RefundEngine>,
    config: TriggerConfig,
}

impl InstantTrigger {
    pub fn new(engine: Arc<RefundEngine>, config: TriggerConfig) -> Self {
        Self { engine, config }
    }

    pub async fn on_expired(
        &self,
        variant: Variant,
        user: &UserId,
        session: &SessionId,
        reason: &str,
    ) -> RefundOutcome {
        debug!(variant = %variant, user = %user, session = %session, "expiry trigger");
        self.engine.refund(variant, user, session, reason).await
    }

    /// Refund many sessions, `group_size` at a time with a pause between
    /// groups. Outcomes are returned in input order. A group runs to
    /// completion once started.
    pub async fn on_expired_batch(&self, items: Vec<ExpiredSession>) -> Vec<RefundOutcome> {
        let total = items.len();
        let group_size = self.config.group_size.max(1);
        let mut outcomes: Vec<Option<RefundOutcome>> = vec![None; total];

        let mut items = items.into_iter().enumerate().peekable();
        while items.peek().is_some() {
            let mut group = JoinSet::new();
            for (idx, item) in items.by_ref().take(group_size) {
                let engine = Arc::clone(&self.engine);
                group.spawn(async move {
                    let outcome = engine
                        .refund(item.variant, &item.user, &item.session, &item.reason)
                        .await;
                    (idx, outcome)
                });
            }
            while let Some(joined) = group.join_next().await {
                match joined {
                    Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                    Err(err) => warn!("batch refund task aborted: {err}"),
                }
            }
            if items.peek().is_some() {
                tokio::time::sleep(self.config.group_pause()).await;
            }
        }

        let outcomes: Vec<RefundOutcome> = outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| RefundOutcome::failed("refund task aborted")))
            .collect();
        info!(
            total,
            refunded = outcomes.iter().filter(|o| o.success).count(),
            "batch expiry processed"
        );
        outcomes
    }

    /// Act on a provider poll for `session`.
    ///
    /// A completed poll closes the session so it can never be refunded,
    /// unless a refund already closed it. An expired poll closes it as
    /// expired, which also ends its validity now, and refunds it.
    pub async fn observe(
        &self,
        session: &RentalSession,
        poll: ProviderPoll,
    ) -> Result<PollAction, StoreError> {
        let store = self.engine.ledger().store();
        match poll {
            ProviderPoll::Waiting => Ok(PollAction::NoAction),
            ProviderPoll::Error(message) => {
                debug!(session = %session.id, reason = %message, "provider poll failed");
                Ok(PollAction::NoAction)
            }
            ProviderPoll::Completed(code) => {
                let closed = store
                    .close_session(session.variant, &session.id, SessionStatus::Completed, Utc::now())
                    .await?;
                info!(
                    variant = %session.variant,
                    session = %session.id,
                    closed,
                    "rental completed"
                );
                Ok(PollAction::Completed { code, closed })
            }
            ProviderPoll::Expired => {
                // A missing row still goes to the engine, which recovers
                // the refund from the charge record.
                match store
                    .close_session(session.variant, &session.id, SessionStatus::Expired, Utc::now())
                    .await
                {
                    Ok(_) | Err(StoreError::SessionNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                let outcome = self
                    .on_expired(session.variant, &session.user, &session.id, "provider reported expiry")
                    .await;
                Ok(PollAction::Expired(outcome))
            }
        }
    }
}
