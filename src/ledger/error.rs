//! Error types for ledger operations.

use thiserror::Error;

use crate::Amount;
use crate::model::UserId;
use crate::store::StoreError;

/// Error returned by [`Ledger`](super::Ledger) operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Charge path only: the conditional decrement matched zero rows.
    #[error("insufficient funds for user {user}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        user: UserId,
        balance: Amount,
        requested: Amount,
    },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientFunds {
                user,
                balance,
                requested,
            } => LedgerError::InsufficientFunds {
                user,
                balance,
                requested,
            },
            other => LedgerError::Store(other),
        }
    }
}
