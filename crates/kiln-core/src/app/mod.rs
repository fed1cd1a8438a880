//! App - アプリケーション層
//!
//! ports / storage / registry を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 構築とワイヤリング（起動時検証つき）
//! - **StageRegistry**: ステージ名 → executor と失敗ポリシー
//! - **JobRunner**: 1 ジョブ分のステージ実行（リトライ / fallback / キャンセル）
//! - **WorkerPool**: 固定数のワーカー（claim → 実行 → 終端）
//! - **LifecycleManager**: staging 回収・期限切れ・アーカイブ・パージ
//! - **StatusQueryService**: キャッシュ優先のステータス照会

pub mod builder;
pub mod config;
pub mod lifecycle;
pub mod pipeline;
pub mod stages;
pub mod status;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::config::{KilnConfig, LifecycleConfig, LockBackend};
pub use self::lifecycle::{ArchiveOutcome, LifecycleHandle, LifecycleManager, LifecycleReport};
pub use self::pipeline::JobRunner;
pub use self::stages::{StagePolicy, StageRegistry, StageRegistryError};
pub use self::status::StatusQueryService;
pub use self::worker_loop::WorkerPool;
