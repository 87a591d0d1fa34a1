//! Actor-based agents for browsing-context ledger state.

pub mod ledger_context;
pub mod request_reply;

pub use ledger_context::{
    ConsumeCredit, ContextSnapshot, ContextSubscription, GetSnapshot, IdentityChanged,
    LedgerContextAgent, LedgerNotice, ResolveBalance, SignIn, SignOut, Subscribe,
};
pub use request_reply::{create_request_reply, send_optional_response, send_response, ResponseChannel};
