//! KilnConfig - 設定
//!
//! TOML から読み込みます。すべてのフィールドは省略可能で、省略時は既定値。
//!
//! ```toml
//! storage_root = "/var/lib/kiln"
//! workers = 4
//! lock_backend = "file"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//!
//! [lifecycle]
//! archive_retention_days = 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::KilnError;
use crate::registry::RetryPolicy;
use crate::storage::ValidationLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    /// Mutex map. Single process only.
    #[default]
    InProcess,

    /// OS file locks under `<root>/locks/`. Safe across processes sharing the root.
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub interval_secs: u64,
    pub staging_ttl_secs: u64,
    pub idle_session_ttl_secs: u64,
    pub archive_retention_days: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            staging_ttl_secs: 3600,
            idle_session_ttl_secs: 86_400,
            archive_retention_days: 90,
        }
    }
}

impl LifecycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn staging_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staging_ttl_secs as i64)
    }

    pub fn idle_session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_session_ttl_secs as i64)
    }

    pub fn archive_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.archive_retention_days as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub storage_root: PathBuf,
    pub workers: usize,
    pub lock_timeout_ms: u64,
    pub registry_read_wait_ms: u64,
    pub lock_backend: LockBackend,
    pub retry: RetryPolicy,
    pub lifecycle: LifecycleConfig,
    pub limits: ValidationLimits,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./kiln-data"),
            workers: 2,
            lock_timeout_ms: 30_000,
            registry_read_wait_ms: 250,
            lock_backend: LockBackend::InProcess,
            retry: RetryPolicy::default(),
            lifecycle: LifecycleConfig::default(),
            limits: ValidationLimits::default(),
        }
    }
}

impl KilnConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, KilnError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, KilnError> {
        let text = std::fs::read_to_string(path).map_err(|e| KilnError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn registry_read_wait(&self) -> Duration {
        Duration::from_millis(self.registry_read_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg = KilnConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, KilnConfig::default());
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.lifecycle.archive_retention(), chrono::Duration::days(90));
        assert_eq!(cfg.limits.max_file_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn nested_tables_override_fields() {
        let cfg = KilnConfig::from_toml_str(
            r#"
            workers = 8
            lock_backend = "file"

            [retry]
            max_attempts = 5

            [lifecycle]
            staging_ttl_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.lock_backend, LockBackend::File);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.multiplier, 2.0);
        assert_eq!(cfg.lifecycle.staging_ttl_secs, 60);
        assert_eq!(cfg.lifecycle.archive_retention_days, 90);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = KilnConfig::from_toml_str("lock_backend = \"redis\"").unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }
}
