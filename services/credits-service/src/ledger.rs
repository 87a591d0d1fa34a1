//! Credit ledger resolver.
//!
//! Answers "how many actions remain for this identity" and "consume one
//! action", and reconciles balances across sign-in and sign-out. Every
//! operation reads the persisted record; nothing is cached here.
//!
//! There is no locking around the read-modify-write in [`CreditLedger::consume_one`]:
//! two concurrent consumptions for one identity may both read the same value
//! and lose an update.

use crate::config::{CreditsConfig, SignInPolicy};
use crate::error::LedgerError;
use crate::identity::{Identity, IdentityTransition, UserId};
use crate::store::{CreditRecord, CreditStore, MemoryCreditStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a resolved balance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceOrigin {
    /// Read from an existing record.
    Existing,
    /// Created by this lookup with the identity's default allowance.
    Seeded,
    /// In-memory default; storage or IP discovery was unavailable.
    Fallback,
}

/// Balance of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    /// Identity the balance belongs to.
    pub identity: Identity,
    /// Actions the identity may still perform.
    pub remaining: u32,
    /// Where the value came from.
    pub origin: BalanceOrigin,
}

/// Outcome of consuming one credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// One credit was consumed and persisted.
    Consumed {
        /// Balance after the consumption.
        remaining: u32,
    },
    /// Nothing left to consume; storage was not touched.
    Exhausted,
}

impl Consumption {
    /// Whether a credit was consumed.
    #[must_use]
    pub const fn is_consumed(self) -> bool {
        matches!(self, Self::Consumed { .. })
    }

    /// Balance after the attempt.
    #[must_use]
    pub const fn remaining(self) -> u32 {
        match self {
            Self::Consumed { remaining } => remaining,
            Self::Exhausted => 0,
        }
    }
}

/// Default allowances per identity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditAllowances {
    /// Seeded for anonymous visitors.
    pub anonymous: u32,
    /// Seeded for signed-in accounts.
    pub authenticated: u32,
    /// Sign-in reconciliation policy.
    pub sign_in_policy: SignInPolicy,
}

impl CreditAllowances {
    /// Default allowance for an identity.
    #[must_use]
    pub const fn default_for(&self, identity: &Identity) -> u32 {
        match identity {
            Identity::Anonymous { .. } => self.anonymous,
            Identity::Authenticated { .. } => self.authenticated,
        }
    }
}

impl Default for CreditAllowances {
    fn default() -> Self {
        Self::from(&CreditsConfig::default())
    }
}

impl From<&CreditsConfig> for CreditAllowances {
    fn from(config: &CreditsConfig) -> Self {
        Self {
            anonymous: config.anonymous_default,
            authenticated: config.authenticated_default,
            sign_in_policy: config.sign_in_policy,
        }
    }
}

/// Resolves and mutates credit balances over a [`CreditStore`].
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
    allowances: CreditAllowances,
}

impl fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreditLedger")
            .field("store", &self.store.name())
            .field("allowances", &self.allowances)
            .finish()
    }
}

impl Default for CreditLedger {
    fn default() -> Self {
        Self::new(Arc::new(MemoryCreditStore::new()), CreditAllowances::default())
    }
}

impl CreditLedger {
    /// Create a ledger over a store.
    #[must_use]
    pub fn new(store: Arc<dyn CreditStore>, allowances: CreditAllowances) -> Self {
        Self { store, allowances }
    }

    /// Configured allowances.
    #[must_use]
    pub const fn allowances(&self) -> &CreditAllowances {
        &self.allowances
    }

    /// In-memory default balance, used when storage cannot be reached.
    ///
    /// Nothing is persisted.
    #[must_use]
    pub fn fallback_balance(&self, identity: &Identity) -> CreditBalance {
        CreditBalance {
            identity: identity.clone(),
            remaining: self.allowances.default_for(identity),
            origin: BalanceOrigin::Fallback,
        }
    }

    /// Resolve the balance for an identity, seeding its default on first lookup.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Lookup`] if the record cannot be read or seeded.
    pub async fn resolve_balance(&self, identity: &Identity) -> Result<CreditBalance, LedgerError> {
        let existing = self
            .store
            .fetch(identity)
            .await
            .map_err(|source| LedgerError::Lookup {
                identity: identity.clone(),
                source,
            })?;

        if let Some(record) = existing {
            debug!(%identity, remaining = record.credits_remaining, "Resolved credit balance");
            return Ok(CreditBalance {
                identity: identity.clone(),
                remaining: record.credits_remaining,
                origin: BalanceOrigin::Existing,
            });
        }

        let remaining = self.allowances.default_for(identity);
        self.store
            .upsert(&CreditRecord::new(identity, remaining))
            .await
            .map_err(|source| LedgerError::Lookup {
                identity: identity.clone(),
                source,
            })?;

        info!(%identity, remaining, "Seeded credit balance");
        Ok(CreditBalance {
            identity: identity.clone(),
            remaining,
            origin: BalanceOrigin::Seeded,
        })
    }

    /// Consume one credit for an identity.
    ///
    /// A never-seen identity is seeded first. At zero nothing is written and
    /// [`Consumption::Exhausted`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Lookup`] if the current balance cannot be read,
    /// or [`LedgerError::Update`] if the decremented balance cannot be written.
    pub async fn consume_one(&self, identity: &Identity) -> Result<Consumption, LedgerError> {
        let current = self.resolve_balance(identity).await?;
        let Some(remaining) = current.remaining.checked_sub(1) else {
            debug!(%identity, "Credits exhausted");
            return Ok(Consumption::Exhausted);
        };

        self.store
            .upsert(&CreditRecord::new(identity, remaining))
            .await
            .map_err(|source| LedgerError::Update {
                identity: identity.clone(),
                source,
            })?;

        debug!(%identity, remaining, "Consumed one credit");
        Ok(Consumption::Consumed { remaining })
    }

    /// Reconcile the balance for an identity change.
    ///
    /// Sign-in never merges the previous anonymous balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Lookup`] if the target balance cannot be read or
    /// written.
    pub async fn on_identity_transition(
        &self,
        transition: &IdentityTransition,
    ) -> Result<CreditBalance, LedgerError> {
        match transition {
            IdentityTransition::SignedIn { user_id } => self.sign_in(user_id).await,
            IdentityTransition::SignedOut { ip } => {
                self.resolve_balance(&Identity::anonymous(*ip)).await
            }
        }
    }

    async fn sign_in(&self, user_id: &UserId) -> Result<CreditBalance, LedgerError> {
        let identity = Identity::authenticated(user_id.clone());

        if self.allowances.sign_in_policy == SignInPolicy::Preserve {
            return self.resolve_balance(&identity).await;
        }

        let remaining = self.allowances.authenticated;
        self.store
            .upsert(&CreditRecord::new(&identity, remaining))
            .await
            .map_err(|source| LedgerError::Lookup {
                identity: identity.clone(),
                source,
            })?;

        info!(%identity, remaining, "Reseeded credit balance on sign-in");
        Ok(CreditBalance {
            identity,
            remaining,
            origin: BalanceOrigin::Seeded,
        })
    }
}
