// src/store/locks.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Keyed reader/writer locks, one per tenant id.
///
/// Writers on the same tenant are serialized; different tenants never contend.
/// The outer mutex only guards insertion and removal of keys.
#[derive(Debug, Default)]
pub struct TenantLocks {
    locks: Mutex<HashMap<u32, Arc<RwLock<()>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, tenant_id: u32) -> Arc<RwLock<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquires the write side for a tenant
    pub async fn exclusive(&self, tenant_id: u32) -> OwnedRwLockWriteGuard<()> {
        self.entry(tenant_id).write_owned().await
    }

    /// Acquires the read side for a tenant
    pub async fn shared(&self, tenant_id: u32) -> OwnedRwLockReadGuard<()> {
        self.entry(tenant_id).read_owned().await
    }

    /// Drops the lock entry of a deleted tenant if nobody else holds it
    pub fn forget(&self, tenant_id: u32) {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(lock) = locks.get(&tenant_id) {
            // One reference lives in the map; more means a holder or waiter
            if Arc::strong_count(lock) == 1 {
                locks.remove(&tenant_id);
            }
        }
    }

    /// Number of tracked tenants
    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn writers_on_one_tenant_are_serialized() {
        let locks = Arc::new(TenantLocks::new());
        let guard = locks.exclusive(10001).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.exclusive(10001).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_tenants_do_not_contend() {
        let locks = TenantLocks::new();
        let _a = locks.exclusive(10001).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.exclusive(10002))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn readers_share() {
        let locks = TenantLocks::new();
        let _a = locks.shared(10001).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.shared(10001))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn forget_skips_held_locks() {
        let locks = TenantLocks::new();
        let guard = locks.exclusive(10001).await;
        locks.forget(10001);
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.forget(10001);
        assert!(locks.is_empty());
    }
}
