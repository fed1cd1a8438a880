//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻 + 80bit 乱数で ULID を作る

use std::sync::Arc;

use crate::domain::{FileId, JobId, SessionId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator はシステム全体で再利用されない ID を生成
pub trait IdGenerator: Send + Sync {
    fn session_id(&self) -> SessionId;
    fn job_id(&self) -> JobId;
    fn file_id(&self) -> FileId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// FixedClock を渡すと timestamp 部分が決定的になります（乱数部分は別）。
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn session_id(&self) -> SessionId {
        SessionId::from(self.next())
    }

    fn job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn file_id(&self) -> FileId {
        FileId::from(self.next())
    }
}
