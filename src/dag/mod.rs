//! DAG Runner — dependency-ordered stage executor (component H).
//!
//! Cycle detection and dependency structure lean on `petgraph`'s topological
//! sort the same way a level-based pipeline executor would validate its
//! graph; scheduling itself is event-driven rather than level-batched, since
//! stages carry independent retry/budget timers.

use crate::bus::EventBus;
use crate::types::{Error, Result, StageId};
use async_trait::async_trait;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(rename = "delayMs")]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Budget {
    #[serde(rename = "timeMs")]
    pub time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    #[serde(rename = "dependsOn", default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<Stage>,
}

impl DagConfig {
    /// Validates uniqueness of ids, dependency references, absence of
    /// self-dependencies, and acyclicity (via topological sort).
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.clone()) {
                return Err(Error::config(format!("duplicate stage id '{}'", stage.id)));
            }
        }
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index_of: HashMap<String, NodeIndex> = HashMap::new();
        for stage in &self.stages {
            let idx = graph.add_node(stage.id.clone());
            index_of.insert(stage.id.clone(), idx);
        }
        for stage in &self.stages {
            for dep in &stage.depends_on {
                if dep == &stage.id {
                    return Err(Error::config(format!("stage '{}' depends on itself", stage.id)));
                }
                let Some(&dep_idx) = index_of.get(dep) else {
                    return Err(Error::config(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.id, dep
                    )));
                };
                graph.add_edge(dep_idx, index_of[&stage.id], ());
            }
        }
        if let Err(cycle) = toposort(&graph, None) {
            return Err(Error::config(format!(
                "cycle detected in dag '{}' at stage '{}'",
                self.id, graph[cycle.node_id()]
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

/// Context handed to every stage handler. `results` is a deep copy of
/// completed stages' outputs, never a shared reference.
pub struct HandlerContext {
    pub stage: Stage,
    pub dag: DagConfig,
    pub results: HashMap<String, serde_json::Value>,
    pub initial_context: serde_json::Value,
    pub bus: Arc<Mutex<EventBus>>,
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value>;
}

impl<F, Fut> StageHandler for F
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    fn handle<'a, 'async_trait>(
        &'a self,
        ctx: HandlerContext,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<serde_json::Value>> + Send + 'async_trait>>
    where
        'a: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin((self)(ctx))
    }
}

#[derive(Debug, Clone)]
struct RuntimeState {
    status: StageStatus,
    attempts_used: u32,
    output: Option<serde_json::Value>,
}

enum Outcome {
    Completed { id: String, output: serde_json::Value },
    Failed { id: String, error: Error, retry_eligible: bool },
}

/// Single-shot dependency-ordered executor: one `DagRunner` per adventure run.
pub struct DagRunner {
    dag: DagConfig,
    bus: Arc<Mutex<EventBus>>,
    handlers: HashMap<String, Arc<dyn StageHandler>>,
    state: Arc<Mutex<HashMap<String, RuntimeState>>>,
}

impl DagRunner {
    pub fn new(dag: DagConfig, bus: Arc<Mutex<EventBus>>) -> Result<Self> {
        dag.validate()?;
        let state = dag
            .stages
            .iter()
            .map(|s| (s.id.clone(), RuntimeState { status: StageStatus::Pending, attempts_used: 0, output: None }))
            .collect();
        Ok(Self { dag, bus, handlers: HashMap::new(), state: Arc::new(Mutex::new(state)) })
    }

    pub fn register_stage_handler(&mut self, id: impl Into<String>, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(id.into(), handler);
    }

    pub async fn get_status(&self) -> HashMap<String, StageStatus> {
        self.state.lock().await.iter().map(|(k, v)| (k.clone(), v.status)).collect()
    }

    /// Resets to the initial pending state. Only valid when no stage is
    /// mid-flight (`Scheduled` or `Running`).
    pub async fn reset(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        if guard.values().any(|s| matches!(s.status, StageStatus::Scheduled | StageStatus::Running)) {
            return Err(Error::state_transition("cannot reset a dag runner with in-flight stages"));
        }
        for state in guard.values_mut() {
            *state = RuntimeState { status: StageStatus::Pending, attempts_used: 0, output: None };
        }
        Ok(())
    }

    pub async fn start(&self, initial_context: serde_json::Value) -> Result<HashMap<String, serde_json::Value>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();
        let mut in_flight = 0usize;

        self.spawn_eligible(&initial_context, &tx, &mut in_flight).await;

        while in_flight > 0 {
            let Some(outcome) = rx.recv().await else { break };
            in_flight -= 1;
            match outcome {
                Outcome::Completed { id, output } => {
                    let mut guard = self.state.lock().await;
                    if let Some(s) = guard.get_mut(&id) {
                        s.status = StageStatus::Completed;
                        s.output = Some(output.clone());
                    }
                    drop(guard);
                    self.bus.lock().await.emit(
                        "orchestrator:stage:complete",
                        serde_json::json!({ "dagId": self.dag.id, "stageId": id, "output": output }),
                    );
                }
                Outcome::Failed { id, error, retry_eligible } => {
                    let stage = self.dag.stages.iter().find(|s| s.id == id).expect("known stage");
                    if retry_eligible {
                        self.bus.lock().await.emit(
                            "orchestrator:stage:retry",
                            serde_json::json!({ "dagId": self.dag.id, "stageId": id, "error": error.to_string() }),
                        );
                        let mut guard = self.state.lock().await;
                        if let Some(s) = guard.get_mut(&id) {
                            s.status = StageStatus::Pending;
                        }
                        drop(guard);
                        let delay = std::time::Duration::from_millis(stage.retry.delay_ms);
                        tokio::time::sleep(delay).await;
                        in_flight += 1;
                        self.spawn_one(stage.clone(), &initial_context, &tx).await;
                        continue;
                    }
                    if stage.optional {
                        let mut guard = self.state.lock().await;
                        if let Some(s) = guard.get_mut(&id) {
                            s.status = StageStatus::Skipped;
                        }
                        drop(guard);
                    } else {
                        let mut guard = self.state.lock().await;
                        if let Some(s) = guard.get_mut(&id) {
                            s.status = StageStatus::Failed;
                        }
                        for (other_id, other) in guard.iter_mut() {
                            if other_id != &id && !matches!(other.status, StageStatus::Completed | StageStatus::Skipped | StageStatus::Failed) {
                                other.status = StageStatus::Blocked;
                            }
                        }
                        drop(guard);
                        self.bus.lock().await.emit(
                            "orchestrator:stage:failed",
                            serde_json::json!({ "dagId": self.dag.id, "stageId": id, "error": error.to_string() }),
                        );
                        self.bus.lock().await.emit(
                            "orchestrator:failed",
                            serde_json::json!({ "dagId": self.dag.id, "stageId": id, "error": error.to_string() }),
                        );
                        return Err(error);
                    }
                }
            }
            self.spawn_eligible(&initial_context, &tx, &mut in_flight).await;
        }

        let guard = self.state.lock().await;
        let results: HashMap<String, serde_json::Value> = guard
            .iter()
            .filter_map(|(id, s)| s.output.clone().map(|o| (id.clone(), o)))
            .collect();
        drop(guard);
        self.bus.lock().await.emit(
            "orchestrator:complete",
            serde_json::json!({ "dagId": self.dag.id, "results": results }),
        );
        Ok(results)
    }

    async fn spawn_eligible(
        &self,
        initial_context: &serde_json::Value,
        tx: &mpsc::UnboundedSender<Outcome>,
        in_flight: &mut usize,
    ) {
        let eligible: Vec<Stage> = {
            let guard = self.state.lock().await;
            self.dag
                .stages
                .iter()
                .filter(|stage| {
                    guard.get(&stage.id).map(|s| s.status == StageStatus::Pending).unwrap_or(false)
                        && stage.depends_on.iter().all(|dep| {
                            matches!(
                                guard.get(dep).map(|s| s.status),
                                Some(StageStatus::Completed) | Some(StageStatus::Skipped)
                            )
                        })
                })
                .cloned()
                .collect()
        };
        for stage in eligible {
            {
                let mut guard = self.state.lock().await;
                if let Some(s) = guard.get_mut(&stage.id) {
                    s.status = StageStatus::Scheduled;
                }
            }
            self.bus.lock().await.emit(
                "orchestrator:stage:scheduled",
                serde_json::json!({ "dagId": self.dag.id, "stageId": stage.id }),
            );
            *in_flight += 1;
            self.spawn_one(stage, initial_context, tx).await;
        }
    }

    async fn spawn_one(&self, stage: Stage, initial_context: &serde_json::Value, tx: &mpsc::UnboundedSender<Outcome>) {
        let Some(handler) = self.handlers.get(&stage.id).cloned() else {
            let _ = tx.send(Outcome::Failed {
                id: stage.id.clone(),
                error: Error::handler_missing(stage.id.clone(), stage.stage_type.clone()),
                retry_eligible: false,
            });
            return;
        };

        {
            let mut guard = self.state.lock().await;
            if let Some(s) = guard.get_mut(&stage.id) {
                s.status = StageStatus::Running;
            }
        }
        self.bus.lock().await.emit(
            "orchestrator:stage:start",
            serde_json::json!({ "dagId": self.dag.id, "stageId": stage.id }),
        );

        let results = {
            let guard = self.state.lock().await;
            guard
                .iter()
                .filter_map(|(id, s)| s.output.clone().map(|o| (id.clone(), o)))
                .collect::<HashMap<_, _>>()
        };
        let ctx = HandlerContext {
            stage: stage.clone(),
            dag: self.dag.clone(),
            results,
            initial_context: initial_context.clone(),
            bus: self.bus.clone(),
        };

        let tx = tx.clone();
        let state = self.state.clone();
        let budget_ms = stage.budget.time_ms;
        let stage_id = stage.id.clone();
        let attempts = stage.retry.attempts;

        tokio::spawn(async move {
            let fut = handler.handle(ctx);
            let outcome = match budget_ms {
                Some(ms) => match tokio::time::timeout(std::time::Duration::from_millis(ms), fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::stage_timeout(stage_id.clone(), ms)),
                },
                None => fut.await,
            };

            match outcome {
                Ok(output) => {
                    let _ = tx.send(Outcome::Completed { id: stage_id, output });
                }
                Err(error) => {
                    let attempts_used = {
                        let mut guard = state.lock().await;
                        let entry = guard.entry(stage_id.clone()).or_insert(RuntimeState {
                            status: StageStatus::Running,
                            attempts_used: 0,
                            output: None,
                        });
                        entry.attempts_used += 1;
                        entry.attempts_used
                    };
                    let retry_eligible = error.is_retryable() && attempts_used <= attempts;
                    let _ = tx.send(Outcome::Failed { id: stage_id, error, retry_eligible });
                }
            }
        });
    }
}
