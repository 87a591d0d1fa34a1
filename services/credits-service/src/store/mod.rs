//! Persistence of credit records.
//!
//! A record is addressed by `user_id` when present, otherwise by `ip_address`
//! with a null `user_id`. Writes are last-write-wins; there is no
//! transaction around a read-modify-write.

mod memory;
mod sql;

pub use memory::MemoryCreditStore;
pub use sql::SqlCreditStore;

use crate::error::{StoreError, StoreResult};
use crate::identity::{Identity, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Persisted credit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRecord {
    /// Account id for authenticated records.
    pub user_id: Option<String>,
    /// IP address for anonymous records.
    pub ip_address: Option<String>,
    /// Actions the identity may still perform.
    pub credits_remaining: u32,
}

impl CreditRecord {
    /// Build the record for `identity` holding `credits_remaining`.
    #[must_use]
    pub fn new(identity: &Identity, credits_remaining: u32) -> Self {
        match identity {
            Identity::Anonymous { ip } => Self {
                user_id: None,
                ip_address: Some(ip.to_string()),
                credits_remaining,
            },
            Identity::Authenticated { user_id } => Self {
                user_id: Some(user_id.as_str().to_string()),
                ip_address: None,
                credits_remaining,
            },
        }
    }

    /// Recover the identity this record is addressed by.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRecord`] if neither key is usable.
    pub fn identity(&self) -> StoreResult<Identity> {
        if let Some(user_id) = self.user_id.as_deref() {
            return UserId::new(user_id)
                .map(Identity::authenticated)
                .ok_or_else(|| StoreError::InvalidRecord("blank user_id".to_string()));
        }

        let ip = self
            .ip_address
            .as_deref()
            .ok_or_else(|| StoreError::InvalidRecord("record has no key".to_string()))?;
        ip.parse::<IpAddr>()
            .map(Identity::anonymous)
            .map_err(|e| StoreError::InvalidRecord(format!("ip_address {ip:?}: {e}")))
    }
}

/// Storage backend for credit records.
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Load the record for an identity, if one exists.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried.
    async fn fetch(&self, identity: &Identity) -> StoreResult<Option<CreditRecord>>;

    /// Insert or overwrite the record addressed by `record`'s key.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    async fn upsert(&self, record: &CreditRecord) -> StoreResult<()>;

    /// Name of the backend, for logs.
    fn name(&self) -> &'static str;
}
