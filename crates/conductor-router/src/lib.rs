pub mod cost;
pub mod credentials;
pub mod decision;
pub mod ledger;
pub mod router;

pub use credentials::CredentialSet;
pub use decision::{
    Rejection, RejectionReason, RouteContext, RouterDecision, RouterRequest, Selection,
};
pub use ledger::{BudgetCeilings, BudgetError, BudgetLedger, BudgetScope, LedgerSnapshot, Spend};
pub use router::CapabilityRouter;
