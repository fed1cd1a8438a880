//! StageRegistry - ステージ名 → executor と失敗ポリシー
//!
//! 同じ名前の二重登録はエラー。ステージ名はパスの一部になるので
//! `[a-z0-9_-]+` 以外は登録できません。

use std::collections::HashMap;
use std::sync::Arc;

use crate::ports::StageExecutor;
use crate::registry::RetryPolicy;
use crate::storage::paths::is_valid_stage_name;

/// How the runner treats a stage's failures.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePolicy {
    /// Bound for transient failures.
    pub retry: RetryPolicy,

    /// Allow one fallback-mode attempt after resource exhaustion.
    pub fallback: bool,
}

impl StagePolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            fallback: true,
        }
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback = false;
        self
    }
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[derive(Clone)]
pub struct RegisteredStage {
    pub executor: Arc<dyn StageExecutor>,
    pub policy: StagePolicy,

    /// Passed verbatim to every invocation. `Null` when unset.
    pub config: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum StageRegistryError {
    #[error("stage '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("invalid stage name '{0}'")]
    InvalidName(String),

    #[error("stage '{0}' is not registered")]
    Unknown(String),
}

#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, RegisteredStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        executor: Arc<dyn StageExecutor>,
        policy: StagePolicy,
    ) -> Result<(), StageRegistryError> {
        if !is_valid_stage_name(name) {
            return Err(StageRegistryError::InvalidName(name.to_string()));
        }
        if self.stages.contains_key(name) {
            return Err(StageRegistryError::AlreadyRegistered(name.to_string()));
        }
        self.stages.insert(
            name.to_string(),
            RegisteredStage {
                executor,
                policy,
                config: serde_json::Value::Null,
            },
        );
        Ok(())
    }

    pub fn configure(
        &mut self,
        name: &str,
        config: serde_json::Value,
    ) -> Result<(), StageRegistryError> {
        let stage = self
            .stages
            .get_mut(name)
            .ok_or_else(|| StageRegistryError::Unknown(name.to_string()))?;
        stage.config = config;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredStage> {
        self.stages.get(name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageError;
    use crate::ports::StageRequest;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl StageExecutor for Noop {
        async fn execute(&self, _request: StageRequest<'_>) -> Result<(), StageError> {
            Ok(())
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = StageRegistry::new();
        registry
            .register("eval", Arc::new(Noop), StagePolicy::default())
            .unwrap();
        assert!(registry.get("eval").is_some());
        assert!(registry.get("nms").is_none());
        assert_eq!(registry.registered_names(), vec!["eval".to_string()]);
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = StageRegistry::new();
        registry
            .register("eval", Arc::new(Noop), StagePolicy::default())
            .unwrap();
        let err = registry
            .register("eval", Arc::new(Noop), StagePolicy::default())
            .unwrap_err();
        assert!(matches!(err, StageRegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn configure_requires_registered_stage() {
        let mut registry = StageRegistry::new();
        let err = registry
            .configure("eval", serde_json::json!({"iou": 0.5}))
            .unwrap_err();
        assert!(matches!(err, StageRegistryError::Unknown(_)));

        registry
            .register("eval", Arc::new(Noop), StagePolicy::default())
            .unwrap();
        registry
            .configure("eval", serde_json::json!({"iou": 0.5}))
            .unwrap();
        assert_eq!(registry.get("eval").unwrap().config["iou"], 0.5);
    }

    #[test]
    fn path_like_names_are_rejected() {
        let mut registry = StageRegistry::new();
        let err = registry
            .register("../x", Arc::new(Noop), StagePolicy::default())
            .unwrap_err();
        assert!(matches!(err, StageRegistryError::InvalidName(_)));
    }
}
