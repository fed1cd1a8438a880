//! Storage - セッション単位のファイル管理
//!
//! - **paths**: パス解決（純粋関数）
//! - **atomic**: 一時ファイル + rename による原子的書き込み
//! - **validate**: アップロード検証
//! - **session_store**: メタデータのロック付き更新とアップロード登録
//! - **archive**: `.tar.gz` への固めと検証

pub mod archive;
pub mod atomic;
pub mod paths;
pub mod session_store;
pub mod validate;

pub use self::paths::StorageLayout;
pub use self::session_store::SessionStore;
pub use self::validate::{ImageValidator, ValidationLimits};
