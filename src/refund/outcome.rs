use std::fmt;

use crate::Amount;
use crate::model::TxId;

/// Why a refund was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    /// The rental was used successfully.
    Completed,
    /// The rental has not expired yet.
    NotExpired,
    /// The session belongs to another user.
    WrongOwner,
    /// Nothing refundable was charged.
    NothingCharged,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IneligibleReason::Completed => "session completed successfully",
            IneligibleReason::NotExpired => "session has not expired yet",
            IneligibleReason::WrongOwner => "session belongs to another user",
            IneligibleReason::NothingCharged => "no refundable charge",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundStatus {
    Refunded,
    /// Claim already set or a refund is already recorded.
    AlreadyProcessed,
    Ineligible(IneligibleReason),
    /// No session row and no charge evidence.
    NotFound,
    /// Unexpected failure; nothing was applied and the call may be retried.
    Failed,
}

/// Result of one refund attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundOutcome {
    pub success: bool,
    pub amount: Amount,
    pub message: String,
    pub status: RefundStatus,
    /// The refund transaction, when one was written by this call.
    pub transaction: Option<TxId>,
}

impl RefundOutcome {
    pub fn refunded(amount: Amount, transaction: TxId, message: impl Into<String>) -> Self {
        Self {
            success: true,
            amount,
            message: message.into(),
            status: RefundStatus::Refunded,
            transaction: Some(transaction),
        }
    }

    pub fn already_processed() -> Self {
        Self::negative(RefundStatus::AlreadyProcessed, "refund already processed")
    }

    pub fn ineligible(reason: IneligibleReason) -> Self {
        Self::negative(RefundStatus::Ineligible(reason), reason.to_string())
    }

    pub fn not_found() -> Self {
        Self::negative(RefundStatus::NotFound, "session not found")
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::negative(RefundStatus::Failed, message)
    }

    fn negative(status: RefundStatus, message: impl Into<String>) -> Self {
        Self {
            success: false,
            amount: Amount::ZERO,
            message: message.into(),
            status,
            transaction: None,
        }
    }

    pub fn is_already_processed(&self) -> bool {
        self.status == RefundStatus::AlreadyProcessed
    }
}
