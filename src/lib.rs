pub mod amount;
pub mod config;
pub mod csv;
pub mod ledger;
pub mod lifecycle;
pub mod model;
pub mod pricing;
pub mod queue;
pub mod refund;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod trigger;

pub use amount::Amount;
pub use config::Settings;
pub use ledger::{Ledger, LedgerError};
pub use model::{RentalSession, SessionId, SessionStatus, Transaction, TxId, UserId, Variant};
pub use queue::AllocationQueue;
pub use refund::{RefundEngine, RefundOutcome, RefundStatus};
pub use scheduler::ReconciliationScheduler;
pub use store::{MemoryStore, Store, StoreError};
pub use trigger::InstantTrigger;
