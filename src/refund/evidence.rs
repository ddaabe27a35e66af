//! Matching of ledger history against a session.
//!
//! Used for emergency recovery of sessions whose row is gone, and as a
//! second idempotency check for records written before the claim flag
//! existed. A transaction whose reference lives in another variant's
//! namespace never matches, so one variant cannot consume another's
//! charge or be blocked by another's refund.

use crate::model::{SessionId, Transaction, TransactionKind, UserId, Variant};

fn foreign_namespace(tx: &Transaction, variant: Variant) -> bool {
    Variant::ALL
        .iter()
        .filter(|&&other| other != variant)
        .any(|other| tx.reference.starts_with(&format!("{}_", other.namespace())))
}

/// A refund already recorded for `session`, by exact reference or by a
/// refund description naming the session.
pub fn existing_refund<'a>(
    history: &'a [Transaction],
    variant: Variant,
    reference: &str,
    session: &SessionId,
) -> Option<&'a Transaction> {
    history.iter().find(|tx| {
        tx.reference == reference
            || (tx.kind == TransactionKind::Refund
                && tx.mentions_session(session)
                && !foreign_namespace(tx, variant))
    })
}

/// The original charge for `session`: the exact charge reference first,
/// then any debit whose description names the session.
pub fn original_charge<'a>(
    history: &'a [Transaction],
    variant: Variant,
    user: &UserId,
    session: &SessionId,
) -> Option<&'a Transaction> {
    let reference = variant.charge_reference(user, session);
    let is_debit = |tx: &&Transaction| tx.kind == TransactionKind::Charge && tx.amount.minor() < 0;
    history
        .iter()
        .filter(is_debit)
        .find(|tx| tx.reference == reference)
        .or_else(|| {
            history.iter().filter(is_debit).find(|tx| {
                tx.mentions_session(session) && !foreign_namespace(tx, variant)
            })
        })
}
