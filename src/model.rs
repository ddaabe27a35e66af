//! Core domain types shared by the ledger, refund engine and scheduler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Amount;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// User identifier.
    UserId
);
string_id!(
    /// Rental session identifier.
    SessionId
);

/// Ledger-assigned transaction identifier, increasing in commit order.
pub type TxId = u64;

/// Independent rental products. Each one owns a separate reference
/// namespace so claims and refunds never collide across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// One-shot SMS verification number.
    Sms,
    /// Voice-call verification number.
    Voice,
    /// Longer-lived number rental.
    Rental,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Sms, Variant::Voice, Variant::Rental];

    /// Prefix used for every idempotency reference of this variant.
    pub fn namespace(self) -> &'static str {
        match self {
            Variant::Sms => "sms",
            Variant::Voice => "voice",
            Variant::Rental => "rental",
        }
    }

    /// Idempotency reference of the refund for `session`.
    pub fn refund_reference(self, user: &UserId, session: &SessionId) -> String {
        format!("{}_refund_{user}_{session}", self.namespace())
    }

    /// Idempotency reference of the original charge for `session`.
    pub fn charge_reference(self, user: &UserId, session: &SessionId) -> String {
        format!("{}_charge_{user}_{session}", self.namespace())
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rental variant '{0}'")]
pub struct UnknownVariant(pub String);

impl FromStr for Variant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sms" => Ok(Variant::Sms),
            "voice" => Ok(Variant::Voice),
            "rental" => Ok(Variant::Rental),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Lifecycle state of a rental session. `Completed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Completed,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Waiting)
    }
}

/// A paid, time-bounded rental of one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RentalSession {
    pub id: SessionId,
    pub user: UserId,
    pub variant: Variant,
    /// Priced service name (e.g. the messaging app the number is for).
    pub service: String,
    pub status: SessionStatus,
    /// Amount charged when the session was opened.
    pub cost: Amount,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// One-way claim flag: at most one refund per session.
    pub refund_processed: bool,
    pub refund_processed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl RentalSession {
    /// Create a session in the `Waiting` state.
    pub fn new(
        id: impl Into<SessionId>,
        user: impl Into<UserId>,
        variant: Variant,
        service: impl Into<String>,
        cost: Amount,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            variant,
            service: service.into(),
            status: SessionStatus::Waiting,
            cost,
            created_at: Utc::now(),
            expires_at,
            refund_processed: false,
            refund_processed_at: None,
            closed_at: None,
        }
    }

    /// Close as `Expired` at `at`, ending validity no later than `at`.
    pub fn expire(&mut self, at: DateTime<Utc>) {
        self.status = SessionStatus::Expired;
        self.closed_at = Some(at);
        if at < self.expires_at {
            self.expires_at = at;
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether a refund could currently be applied, ignoring ledger history.
    pub fn is_refund_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.refund_processed
            && self.status != SessionStatus::Completed
            && self.is_expired_at(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
    Charge,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
    Pending,
    Failed,
}

/// Immutable ledger record. `balance_after - balance_before == amount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxId,
    pub user: UserId,
    pub kind: TransactionKind,
    /// Signed effect on the balance (charges are negative).
    pub amount: Amount,
    /// Unique idempotency reference.
    pub reference: String,
    pub description: String,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Whether the description names `session` as a whole token.
    pub fn mentions_session(&self, session: &SessionId) -> bool {
        self.description
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .any(|token| token == session.as_str())
    }
}

/// A transaction before the ledger assigns its id and timestamp.
///
/// Balances may be supplied by a caller that already performed the mutation
/// in the same atomic scope; when absent the store computes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDraft {
    pub user: UserId,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub reference: String,
    pub description: String,
    pub balance_before: Option<Amount>,
    pub balance_after: Option<Amount>,
    pub status: TransactionStatus,
}

impl TransactionDraft {
    pub fn new(
        user: UserId,
        kind: TransactionKind,
        amount: Amount,
        reference: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user,
            kind,
            amount,
            reference: reference.into(),
            description: description.into(),
            balance_before: None,
            balance_after: None,
            status: TransactionStatus::Completed,
        }
    }

    pub fn with_balances(mut self, before: Amount, after: Amount) -> Self {
        self.balance_before = Some(before);
        self.balance_after = Some(after);
        self
    }
}

/// Result of an atomic balance increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    pub before: Amount,
    pub after: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn references_are_namespaced_per_variant() {
        let user = UserId::from("u1");
        let session = SessionId::from("S1");
        assert_eq!(Variant::Sms.refund_reference(&user, &session), "sms_refund_u1_S1");
        assert_eq!(
            Variant::Voice.refund_reference(&user, &session),
            "voice_refund_u1_S1"
        );
        assert_eq!(
            Variant::Rental.charge_reference(&user, &session),
            "rental_charge_u1_S1"
        );
    }

    #[test]
    fn variant_parses_case_insensitively() {
        assert_eq!("SMS".parse::<Variant>(), Ok(Variant::Sms));
        assert_eq!(" rental ".parse::<Variant>(), Ok(Variant::Rental));
        assert!("fax".parse::<Variant>().is_err());
    }

    #[test]
    fn eligibility_requires_expiry_and_no_claim() {
        let now = Utc::now();
        let mut session = RentalSession::new(
            "S1",
            "u1",
            Variant::Sms,
            "whatsapp",
            Amount::from_minor(2100),
            now + Duration::seconds(30),
        );
        assert!(!session.is_refund_eligible(now));

        session.expires_at = now - Duration::seconds(1);
        assert!(session.is_refund_eligible(now));

        session.refund_processed = true;
        assert!(!session.is_refund_eligible(now));

        session.refund_processed = false;
        session.status = SessionStatus::Completed;
        assert!(!session.is_refund_eligible(now));
    }

    #[test]
    fn session_mention_matches_whole_tokens_only() {
        let tx = Transaction {
            id: 1,
            user: UserId::from("u1"),
            kind: TransactionKind::Charge,
            amount: Amount::from_minor(-2100),
            reference: "legacy-42".to_string(),
            description: "sms number for session S12 (whatsapp)".to_string(),
            balance_before: Amount::from_minor(5000),
            balance_after: Amount::from_minor(2900),
            status: TransactionStatus::Completed,
            created_at: Utc::now(),
        };
        assert!(tx.mentions_session(&SessionId::from("S12")));
        assert!(!tx.mentions_session(&SessionId::from("S1")));
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Waiting.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
    }
}
