//! In-memory credit store.

use super::{CreditRecord, CreditStore};
use crate::error::{StoreError, StoreResult};
use crate::identity::Identity;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Credit store kept in process memory.
///
/// Used for local development and tests. It can be marked unavailable to
/// reproduce an unreachable backend.
#[derive(Debug, Default)]
pub struct MemoryCreditStore {
    records: DashMap<Identity, CreditRecord>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl MemoryCreditStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful writes since creation.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CreditStore for MemoryCreditStore {
    async fn fetch(&self, identity: &Identity) -> StoreResult<Option<CreditRecord>> {
        self.check_available()?;
        Ok(self.records.get(identity).map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, record: &CreditRecord) -> StoreResult<()> {
        self.check_available()?;
        let identity = record.identity()?;
        self.records.insert(identity, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
