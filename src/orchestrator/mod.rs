//! Orchestrator Manager — config loading, handler registry, adventure
//! lifecycle (component I).

pub mod handlers;
pub mod rpc;

use crate::bus::EventBus;
use crate::dag::{DagConfig, DagRunner, StageHandler};
use crate::types::{AdventureConfig, AdventureId, Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Factory for a `stage.type` value: produces a fresh handler per DAG run.
pub type TypeHandlerFactory = Arc<dyn Fn() -> Arc<dyn StageHandler> + Send + Sync>;

/// An adventure config is either a literal in-memory document or a name
/// resolved against `AdventureConfig.dag_config_dir`.
pub enum AdventureSource {
    Literal(DagConfig),
    Named(String),
}

impl From<DagConfig> for AdventureSource {
    fn from(dag: DagConfig) -> Self {
        AdventureSource::Literal(dag)
    }
}

impl From<&str> for AdventureSource {
    fn from(name: &str) -> Self {
        AdventureSource::Named(name.to_string())
    }
}

#[derive(Default, Clone)]
pub struct StartOptions {
    pub initial_context: serde_json::Value,
    pub auto_reset: bool,
}

pub struct ActiveAdventure {
    pub id: AdventureId,
    pub runner: Arc<DagRunner>,
    handle: Mutex<Option<JoinHandle<Result<HashMap<String, serde_json::Value>>>>>,
}

/// Resolves config sources, maintains the type-handler and per-stage-handler
/// registries, and tracks one in-flight DAG run per adventure id.
pub struct OrchestratorManager {
    bus: Arc<Mutex<EventBus>>,
    config: AdventureConfig,
    type_handlers: Mutex<HashMap<String, TypeHandlerFactory>>,
    stage_handlers: Mutex<HashMap<String, Arc<dyn StageHandler>>>,
    active: Mutex<HashMap<String, Arc<ActiveAdventure>>>,
}

impl OrchestratorManager {
    pub fn new(bus: Arc<Mutex<EventBus>>, config: AdventureConfig) -> Self {
        let mut type_handlers = HashMap::new();
        for (name, handler) in handlers::default_factories(&config) {
            type_handlers.insert(name, handler_to_factory(handler));
        }
        Self {
            bus,
            config,
            type_handlers: Mutex::new(type_handlers),
            stage_handlers: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_type_handler(&self, stage_type: impl Into<String>, factory: TypeHandlerFactory) {
        self.type_handlers.lock().await.insert(stage_type.into(), factory);
    }

    pub async fn register_stage_handler(&self, stage_id: impl Into<String>, handler: Arc<dyn StageHandler>) {
        self.stage_handlers.lock().await.insert(stage_id.into(), handler);
    }

    fn resolve_dag(&self, source: AdventureSource) -> Result<DagConfig> {
        match source {
            AdventureSource::Literal(dag) => Ok(dag),
            AdventureSource::Named(name) => {
                let dir = self
                    .config
                    .dag_config_dir
                    .as_deref()
                    .ok_or_else(|| Error::config("dag_config_dir is not configured; cannot resolve named adventure"))?;
                let path = Path::new(dir).join(&name);
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| Error::config(format!("failed to read dag config '{}': {e}", path.display())))?;
                let mut dag: DagConfig = serde_json::from_str(&contents).map_err(Error::Serialization)?;
                if dag.id.is_empty() {
                    dag.id = Path::new(&name)
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or(&name)
                        .to_string();
                }
                Ok(dag)
            }
        }
    }

    /// Starts one adventure: resolves its DAG config, wires handlers per the
    /// precedence (explicit stage handler > type factory > default no-op),
    /// and spawns the run. Only one active adventure per id is permitted.
    pub async fn start_adventure(&self, source: impl Into<AdventureSource>, options: StartOptions) -> Result<Arc<ActiveAdventure>> {
        let dag = self.resolve_dag(source.into())?;
        let id = dag.id.clone();

        {
            let mut active = self.active.lock().await;
            if let Some(existing) = active.get(&id) {
                if options.auto_reset {
                    existing.runner.reset().await?;
                } else {
                    return Err(Error::state_transition(format!("adventure '{id}' is already active")));
                }
            }
            let mut runner = DagRunner::new(dag.clone(), self.bus.clone())?;
            let type_handlers = self.type_handlers.lock().await;
            let stage_handlers = self.stage_handlers.lock().await;
            for stage in &dag.stages {
                let resolved = stage_handlers
                    .get(&stage.id)
                    .cloned()
                    .or_else(|| type_handlers.get(&stage.stage_type).map(|factory| factory()))
                    .unwrap_or_else(default_noop_handler);
                runner.register_stage_handler(stage.id.clone(), resolved);
            }
            drop(type_handlers);
            drop(stage_handlers);

            let runner = Arc::new(runner);
            let run_runner = runner.clone();
            let initial_context = options.initial_context.clone();
            let handle = tokio::spawn(async move { run_runner.start(initial_context).await });

            let adventure = Arc::new(ActiveAdventure {
                id: AdventureId::new(),
                runner,
                handle: Mutex::new(Some(handle)),
            });
            active.insert(id, adventure.clone());
            Ok(adventure)
        }
    }

    pub async fn get_active_adventures(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    /// Shuts down the manager. `wait_for_completion` joins every in-flight
    /// run before returning; otherwise active runs are left to finish on
    /// their own and are simply dropped from tracking.
    pub async fn shutdown(&self, wait_for_completion: bool) -> Result<()> {
        let adventures: Vec<Arc<ActiveAdventure>> = self.active.lock().await.values().cloned().collect();
        if wait_for_completion {
            for adventure in adventures {
                let mut guard = adventure.handle.lock().await;
                if let Some(handle) = guard.take() {
                    let _ = tokio::time::timeout(self.config.shutdown_timeout, handle).await;
                }
            }
        }
        self.active.lock().await.clear();
        Ok(())
    }
}

fn handler_to_factory(handler: Arc<dyn StageHandler>) -> TypeHandlerFactory {
    Arc::new(move || handler.clone())
}

fn default_noop_handler() -> Arc<dyn StageHandler> {
    Arc::new(|_ctx: crate::dag::HandlerContext| async move { Ok(serde_json::json!({ "skipped": true })) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Stage;

    fn stage(id: &str, stage_type: &str, depends_on: Vec<&str>) -> Stage {
        Stage {
            id: id.to_string(),
            stage_type: stage_type.to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            retry: Default::default(),
            budget: Default::default(),
            payload: serde_json::Value::Null,
            optional: false,
        }
    }

    #[tokio::test]
    async fn unregistered_stage_type_falls_back_to_noop() {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        let manager = OrchestratorManager::new(bus, AdventureConfig::default());
        let dag = DagConfig { id: "d1".to_string(), description: None, stages: vec![stage("a", "mystery", vec![])] };
        let adventure = manager.start_adventure(dag, StartOptions::default()).await.unwrap();
        let mut guard = adventure.handle.lock().await;
        let result = guard.take().unwrap().await.unwrap().unwrap();
        assert_eq!(result["a"], serde_json::json!({ "skipped": true }));
    }

    #[tokio::test]
    async fn explicit_stage_handler_wins_over_type_factory() {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        let manager = OrchestratorManager::new(bus, AdventureConfig::default());
        let explicit: Arc<dyn StageHandler> =
            Arc::new(|_ctx: crate::dag::HandlerContext| async move { Ok(serde_json::json!({ "explicit": true })) });
        manager.register_stage_handler("a", explicit).await;
        let dag = DagConfig { id: "d2".to_string(), description: None, stages: vec![stage("a", "noop", vec![])] };
        let adventure = manager.start_adventure(dag, StartOptions::default()).await.unwrap();
        let mut guard = adventure.handle.lock().await;
        let result = guard.take().unwrap().await.unwrap().unwrap();
        assert_eq!(result["a"], serde_json::json!({ "explicit": true }));
    }

    #[tokio::test]
    async fn duplicate_active_id_without_auto_reset_errors() {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        let manager = OrchestratorManager::new(bus, AdventureConfig::default());
        let dag = DagConfig { id: "d3".to_string(), description: None, stages: vec![stage("a", "noop", vec![])] };
        let first = manager.start_adventure(dag.clone(), StartOptions::default()).await.unwrap();
        {
            let mut guard = first.handle.lock().await;
            let _ = guard.take().unwrap().await;
        }
        let err = manager.start_adventure(dag, StartOptions::default()).await;
        assert!(err.is_err());
    }
}
