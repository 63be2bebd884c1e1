use crate::backend::DetectorBackend;
use crate::manager::ModelManager;
use crate::scorer::ScorerCatalog;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use wakemux_core::{BackendConfig, EngineError, ModelStatus};

/// Lifecycle surface the registry needs from each managed model.
#[async_trait]
pub trait ManagedModel: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn is_loaded(&self) -> bool;
    fn start(self: &Arc<Self>);
    async fn stop(&self);
    async fn get_model(&self) -> Result<(), EngineError>;
    fn status(&self) -> ModelStatus;
}

#[async_trait]
impl ManagedModel for ModelManager {
    fn name(&self) -> &str {
        ModelManager::name(self)
    }

    fn is_loaded(&self) -> bool {
        ModelManager::is_loaded(self)
    }

    fn start(self: &Arc<Self>) {
        ModelManager::start(self)
    }

    async fn stop(&self) {
        ModelManager::stop(self).await
    }

    async fn get_model(&self) -> Result<(), EngineError> {
        ModelManager::get_model(self).await
    }

    fn status(&self) -> ModelStatus {
        ModelManager::status(self)
    }
}

/// Config types that know the registry key they register under.
pub trait RegistryConfig {
    fn registry_name(&self) -> String;
}

impl RegistryConfig for BackendConfig {
    fn registry_name(&self) -> String {
        self.derived_name()
    }
}

pub type ManagerBuilder<M, C> = Box<dyn Fn(C) -> Result<Arc<M>, EngineError> + Send + Sync>;

/// Named managers with an optional default.
pub struct ModelRegistry<M: ManagedModel = ModelManager, C: RegistryConfig = BackendConfig> {
    managers: HashMap<String, Arc<M>>,
    default_model: Option<String>,
    builder: ManagerBuilder<M, C>,
}

impl<M: ManagedModel, C: RegistryConfig> ModelRegistry<M, C> {
    pub fn new(builder: ManagerBuilder<M, C>) -> Self {
        Self {
            managers: HashMap::new(),
            default_model: None,
            builder,
        }
    }

    /// Build and register a manager. The first registration becomes the default.
    pub fn register(&mut self, config: C) -> Result<Arc<M>, EngineError> {
        let name = config.registry_name();
        if self.managers.contains_key(&name) {
            return Err(EngineError::DuplicateModel(name));
        }
        let manager = (self.builder)(config)?;
        self.managers.insert(name.clone(), Arc::clone(&manager));
        if self.default_model.is_none() {
            self.default_model = Some(name.clone());
        }
        info!(model = %name, "model registered");
        Ok(manager)
    }

    /// Resolve `name`, or the default model when `name` is `None`.
    pub fn get_manager(&self, name: Option<&str>) -> Result<Arc<M>, EngineError> {
        let name = match name {
            Some(name) => name,
            None => self
                .default_model
                .as_deref()
                .ok_or(EngineError::NoDefaultModel)?,
        };
        self.managers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel(name.to_string()))
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    pub fn set_default_model(&mut self, name: &str) -> Result<(), EngineError> {
        if !self.managers.contains_key(name) {
            return Err(EngineError::UnknownModel(name.to_string()));
        }
        self.default_model = Some(name.to_string());
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.managers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.managers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Managers sorted by name.
    pub fn managers(&self) -> Vec<Arc<M>> {
        self.names()
            .into_iter()
            .filter_map(|name| self.managers.get(name).cloned())
            .collect()
    }

    pub fn start(&self) {
        for manager in self.managers.values() {
            manager.start();
        }
    }

    pub async fn stop(&self) {
        for manager in self.managers() {
            manager.stop().await;
        }
    }

    /// Load the named models (all when `None`) that are not loaded yet.
    ///
    /// Every target is attempted; the first failure is returned.
    pub async fn preload(&self, names: Option<&[String]>) -> Result<(), EngineError> {
        let targets = match names {
            Some(names) => names
                .iter()
                .map(|name| self.get_manager(Some(name)))
                .collect::<Result<Vec<_>, _>>()?,
            None => self.managers(),
        };

        let mut first_error = None;
        for manager in targets {
            if manager.is_loaded() {
                continue;
            }
            if let Err(e) = manager.get_model().await {
                error!(model = %manager.name(), "preload failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn list_status(&self) -> Vec<ModelStatus> {
        self.managers()
            .iter()
            .map(|manager| {
                let mut status = manager.status();
                status.is_default = self.default_model.as_deref() == Some(manager.name());
                status
            })
            .collect()
    }
}

impl ModelRegistry<ModelManager, BackendConfig> {
    /// Registry whose managers wrap a [`DetectorBackend`] built from `catalog`.
    pub fn with_catalog(catalog: Arc<ScorerCatalog>, ttl: Duration) -> Self {
        Self::new(Box::new(move |config: BackendConfig| {
            config
                .validate()
                .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
            let backend = DetectorBackend::new(config, Arc::clone(&catalog));
            Ok(ModelManager::new(Box::new(backend), ttl))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wakemux_core::ModelState;

    fn registry() -> ModelRegistry {
        let mut catalog = ScorerCatalog::new();
        catalog.register(wakemux_core::ModelInfo::placeholder("hey-bot"), |_| {
            Ok(Box::new(crate::EnergyScorer::default()))
        });
        ModelRegistry::with_catalog(Arc::new(catalog), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_register_then_get_manager_is_unused() {
        let mut registry = registry();
        registry.register(BackendConfig::new("hey-bot")).unwrap();
        let manager = registry.get_manager(Some("hey-bot")).unwrap();
        assert_eq!(manager.stats().load_count, 0);
        assert_eq!(manager.state(), ModelState::Unloaded);
    }

    #[test]
    fn test_first_registered_becomes_default() {
        let mut registry = registry();
        assert!(registry.default_model().is_none());
        registry.register(BackendConfig::new("hey-bot")).unwrap();
        registry.register(BackendConfig::new("energy")).unwrap();
        assert_eq!(registry.default_model(), Some("hey-bot"));
        assert_eq!(registry.get_manager(None).unwrap().name(), "hey-bot");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = registry();
        registry.register(BackendConfig::new("hey-bot")).unwrap();
        match registry.register(BackendConfig::new("models/hey-bot.toml")) {
            Err(EngineError::DuplicateModel(name)) => assert_eq!(name, "hey-bot"),
            _ => panic!("expected DuplicateModel"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_manager_errors() {
        let mut registry = registry();
        assert!(matches!(
            registry.get_manager(None),
            Err(EngineError::NoDefaultModel)
        ));
        registry.register(BackendConfig::new("hey-bot")).unwrap();
        match registry.get_manager(Some("nope")) {
            Err(EngineError::UnknownModel(name)) => assert_eq!(name, "nope"),
            _ => panic!("expected UnknownModel"),
        }
    }

    #[test]
    fn test_set_default_requires_registered_name() {
        let mut registry = registry();
        registry.register(BackendConfig::new("hey-bot")).unwrap();
        registry.register(BackendConfig::new("energy")).unwrap();
        assert!(registry.set_default_model("nope").is_err());
        assert_eq!(registry.default_model(), Some("hey-bot"));
        registry.set_default_model("energy").unwrap();
        assert_eq!(registry.get_manager(None).unwrap().name(), "energy");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut registry = registry();
        let mut config = BackendConfig::new("hey-bot");
        config.trigger_level = 0;
        assert!(matches!(
            registry.register(config),
            Err(EngineError::InvalidConfig(_))
        ));
        assert!(registry.is_empty());
        assert!(registry.default_model().is_none());
    }

    #[tokio::test]
    async fn test_preload_loads_named_models_only() {
        let mut registry = registry();
        registry.register(BackendConfig::new("hey-bot")).unwrap();
        registry.register(BackendConfig::new("energy")).unwrap();

        registry
            .preload(Some(&["energy".to_string()]))
            .await
            .unwrap();
        assert!(registry.get_manager(Some("energy")).unwrap().is_loaded());
        assert!(!registry.get_manager(Some("hey-bot")).unwrap().is_loaded());

        registry.preload(None).await.unwrap();
        assert!(registry.get_manager(Some("hey-bot")).unwrap().is_loaded());
        assert_eq!(
            registry.get_manager(Some("energy")).unwrap().stats().load_count,
            1
        );
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_preload_unknown_name_fails() {
        let mut registry = registry();
        registry.register(BackendConfig::new("hey-bot")).unwrap();
        assert!(matches!(
            registry.preload(Some(&["nope".to_string()])).await,
            Err(EngineError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn test_preload_reports_load_failure() {
        let mut registry = registry();
        registry.register(BackendConfig::new("not-in-catalog")).unwrap();
        registry.register(BackendConfig::new("energy")).unwrap();
        assert!(matches!(
            registry.preload(None).await,
            Err(EngineError::ModelLoad { .. })
        ));
        assert!(registry.get_manager(Some("energy")).unwrap().is_loaded());
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_list_status_snapshot() {
        let mut registry = registry();
        registry.register(BackendConfig::new("hey-bot")).unwrap();
        registry.register(BackendConfig::new("energy")).unwrap();
        registry.start();
        registry.preload(Some(&["hey-bot".to_string()])).await.unwrap();

        let status = registry.list_status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "energy");
        assert!(!status[0].loaded);
        assert!(!status[0].is_default);
        assert!(status[0].ttl_remaining.is_none());
        assert_eq!(status[1].name, "hey-bot");
        assert!(status[1].loaded);
        assert!(status[1].is_default);
        assert_eq!(status[1].device, "cpu");
        assert_eq!(status[1].ttl_seconds, 60.0);
        assert!(status[1].ttl_remaining.is_some());
        assert_eq!(status[1].stats.load_count, 1);

        registry.stop().await;
        registry.stop().await;
        assert!(registry.list_status().iter().all(|s| !s.loaded));
    }
}
