//! InProcessLockManager - 単一ノード向けのキー単位ロック
//!
//! # 実装詳細
//! - HashMap<String, Arc<tokio::sync::Mutex<()>>> でキーごとに Mutex を持つ
//! - `lock_owned()` を timeout で包み、上限を超えたら LockTimeout
//! - 誰も握っていないエントリは一定数を超えたら掃除する

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::KilnError;
use crate::ports::{LockGuard, LockManager};

const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct InProcessLockManager {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InProcessLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > PRUNE_THRESHOLD {
            // strong_count == 1: only the map refers to it, so nobody holds or waits
            locks.retain(|_, m| Arc::strong_count(m) > 1);
        }
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

#[async_trait]
impl LockManager for InProcessLockManager {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard, KilnError> {
        let slot = self.slot(key);
        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(LockGuard::new(key, Box::new(guard))),
            Err(_) => Err(KilnError::LockTimeout {
                key: key.to_string(),
                waited: timeout,
            }),
        }
    }
}
