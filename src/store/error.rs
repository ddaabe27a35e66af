//! Error types for the persistence contract.

use thiserror::Error;

use crate::Amount;
use crate::model::{SessionId, Transaction, UserId};

/// Failure of a [`Store`](super::Store) call.
///
/// Every error returned by [`Store::commit`](super::Store::commit) means
/// nothing in the batch was applied.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Conditional claim matched zero rows: the refund was already claimed.
    #[error("refund for session {0} already claimed")]
    ClaimConflict(SessionId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {0} already exists")]
    SessionExists(SessionId),

    /// The session reached `Completed` and can no longer expire.
    #[error("session {0} already completed")]
    SessionCompleted(SessionId),

    /// A transaction without balances has no balance adjustment in its batch.
    #[error("transaction {0} has no balances and no matching adjustment")]
    UnpairedTransaction(String),

    /// Unique reference constraint hit; carries the record that owns it.
    #[error("transaction reference {} already recorded", .0.reference)]
    DuplicateReference(Box<Transaction>),

    /// Conditional decrement matched zero rows.
    #[error("insufficient funds for user {user}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        user: UserId,
        balance: Amount,
        requested: Amount,
    },

    #[error("balance overflow for user {0}")]
    Overflow(UserId),

    /// The claim-flag column has not been migrated on this store.
    #[error("refund claim storage unavailable")]
    SchemaUnavailable,

    /// Transient failure; the call may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
