//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。各 trait は外部の仕組み
//! （時刻、ID 生成、ロック、正本ログ、キャッシュ、ステージ実行）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - JobLog が正本（source of truth）
//! - StatusCache は助言のみ
//! - ロックのバックエンドはコアから見えない

pub mod clock;
pub mod id_generator;
pub mod job_log;
pub mod lock;
pub mod stage_executor;
pub mod status_cache;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_log::{JobLog, JobLogEntry};
pub use self::lock::{LockGuard, LockManager, session_lock_key};
pub use self::stage_executor::{ArtifactKind, ExecutionMode, StageExecutor, StageRequest};
pub use self::status_cache::StatusCache;
