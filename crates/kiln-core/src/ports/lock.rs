//! LockManager port - キー単位の排他ロック
//!
//! セッションのメタデータ更新はすべてこのロックの下で行います。
//! バックエンドは差し替え可能です:
//! - InProcessLockManager: 単一ノード向けの tokio Mutex マップ
//! - FileLockManager: OS のファイルロック（複数プロセスで共有するストレージ向け）
//!
//! 分散ロックサービスを使う場合もこの trait を実装するだけで済みます。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::KilnError;

/// LockManager は `acquire(key) -> (release, error)` を提供
///
/// タイムアウトを超えたら `KilnError::LockTimeout` を返します（黙って諦めない）。
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard, KilnError>;
}

/// Held lock. Dropping it (or calling `release`) gives the key back.
pub struct LockGuard {
    key: String,
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    pub fn new(key: impl Into<String>, held: Box<dyn Send + Sync>) -> Self {
        Self {
            key: key.into(),
            _held: held,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

pub fn session_lock_key(session_id: &crate::domain::SessionId) -> String {
    format!("session-lock-{session_id}")
}
