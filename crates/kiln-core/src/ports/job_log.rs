//! JobLog port - ジョブ状態の正本（durable log）
//!
//! 状態遷移はまずここに追記され、その後でキャッシュが更新されます。
//! 両者の間でクラッシュしても正本は失われません（キャッシュは助言に過ぎない）。
//!
//! # 実装
//! - **FileJobLog**: `registry/jobs.jsonl` への追記 + fsync
//! - **MemoryJobLog**: テスト用

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{JobRecord, KilnError};

/// One appended mutation: the full record after the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub record: JobRecord,
}

#[async_trait]
pub trait JobLog: Send + Sync {
    /// Durably append `entry`. Returns only after the write is persisted.
    async fn append(&self, entry: &JobLogEntry) -> Result<(), KilnError>;

    /// Every entry in append order.
    async fn replay(&self) -> Result<Vec<JobLogEntry>, KilnError>;
}
