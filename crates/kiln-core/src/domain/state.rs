//! State - ジョブとセッションの状態
//!
//! # Job の状態遷移
//! - queued → processing → completed | failed | cancelled
//! - queued → cancelled（worker が claim する前のみ）
//!
//! 後戻り（processing → queued など）は存在しません。
//! 終端状態（completed / failed / cancelled）からはどこにも遷移しません。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for a worker to claim it.
    Queued,

    /// Claimed by exactly one worker.
    Processing,

    /// Every requested stage succeeded for every input file.
    Completed,

    /// A stage failed permanently (fatal error or exhausted retry budget).
    Failed,

    /// Cancelled before it finished.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Position in the partial order queued < processing < terminal.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 2,
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SessionStatus はセッションのライフサイクル
///
/// - active: アップロード・ジョブ投入を受け付ける
/// - completed: 利用者が終了を宣言した（アーカイブ候補）
/// - expired: アイドル期限切れ（アーカイブ候補）
/// - archived: ライブディレクトリは削除済み、tar.gz のみ残る
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Archived,
    Expired,
}

impl SessionStatus {
    pub fn accepts_work(self) -> bool {
        self == SessionStatus::Active
    }

    pub fn is_archivable(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Expired)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Archived => "archived",
            SessionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}
