//! Credit ledger service.
//!
//! Tracks a small allowance of paid actions per principal. Anonymous visitors
//! are keyed by public IP address, signed-in users by account id. Every
//! browsing context of a browser session keeps its own balance and re-resolves
//! it when another context signs in or out.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agents;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod ip;
pub mod ledger;
pub mod services;
pub mod session;
pub mod store;

// Re-export key types for convenience
pub use agents::{ContextSnapshot, LedgerContextAgent, LedgerNotice};
pub use client::{CreditLedgerClient, IdentityEventStream, RemoteBalance};
pub use config::{CreditsServiceConfig, SignInPolicy};
pub use error::{ClientError, IpDiscoveryError, LedgerError, StoreError};
pub use identity::{Identity, IdentityTransition, UserId};
pub use ip::{HttpIpDiscovery, IpDiscovery, StaticIpDiscovery};
pub use ledger::{BalanceOrigin, Consumption, CreditAllowances, CreditBalance, CreditLedger};
pub use services::CreditsServiceImpl;
pub use session::{BrowsingSession, ContextId, IdentityEvent, SessionHub};
pub use store::{CreditStore, MemoryCreditStore, SqlCreditStore};
