//! The marketplace core: selection state machine, payment reconciliation,
//! refunds and withdrawals. All engines hold an injected [`LedgerDb`] and,
//! where they talk to the gateway, an injected `Arc<dyn PaymentGateway>`.
//!
//! [`LedgerDb`]: crate::ledger::LedgerDb
//! [`PaymentGateway`]: crate::gateway::PaymentGateway

pub mod reconcile;
pub mod refunds;
pub mod selection;

pub use reconcile::{InitiateOutcome, InitiateRequest, ReconciliationEngine};
pub use refunds::{plan_refund_application, RefundEngine, RefundPlan, WithdrawalEligibility};
pub use selection::{RejectionRequest, SelectionEngine};
