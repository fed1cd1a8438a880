//! kiln-core
//!
//! Job orchestration and session-isolated storage for multi-stage image pipelines.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, job, session, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, LockManager, JobLog, StatusCache, StageExecutor）
//! - **impls**: ports の実装（プロセス内ロック、ファイルロック、JSONL ログ、メモリキャッシュ）
//! - **storage**: パス解決、原子的書き込み、アップロード検証、SessionStore、アーカイブ
//! - **registry**: JobRegistry（状態機械 + claim キュー）と RetryPolicy
//! - **app**: builder, worker pool, job runner, lifecycle, status query
//! - **observability**: 件数スナップショット

pub mod app;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod registry;
pub mod storage;

pub use app::{App, AppBuilder, KilnConfig};
pub use domain::KilnError;
