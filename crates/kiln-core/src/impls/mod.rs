//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InProcessLockManager**: 単一ノード向けロック
//! - **FileLockManager**: OS ファイルロック
//! - **InMemoryStatusCache**: ステータスキャッシュ
//! - **FileJobLog / MemoryJobLog**: ジョブの正本ログ

pub mod file_lock;
pub mod inproc_lock;
pub mod job_log;
pub mod memory_cache;

pub use self::file_lock::FileLockManager;
pub use self::inproc_lock::InProcessLockManager;
pub use self::job_log::{FileJobLog, MemoryJobLog};
pub use self::memory_cache::InMemoryStatusCache;
