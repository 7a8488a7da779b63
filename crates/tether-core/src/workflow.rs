// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow bridge.
//!
//! Workflows run in an external engine behind [`WorkflowEngine`]. The
//! instance keeps a tracking row per workflow and receives the engine's
//! notifications as [`WorkflowCallback`]s, which update the row and run the
//! matching agent hook.
//!
//! Inside the workflow, notifications are sent through a [`WorkflowReporter`],
//! which wraps each one as a named durable step so a replayed workflow does
//! not notify twice.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agent::Agent;
use crate::error::CoreError;
use crate::instance::{Instance, InstanceHandle};
use crate::persistence::{ListWorkflowsFilter, Persistence, WorkflowRecord, WorkflowStatus};

/// External workflow executor.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Whether a workflow definition is registered under `binding`.
    fn has_binding(&self, binding: &str) -> bool;

    /// Start a workflow run.
    async fn create(&self, binding: &str, workflow_id: &str, params: &Value) -> anyhow::Result<()>;

    async fn pause(&self, binding: &str, workflow_id: &str) -> anyhow::Result<()>;

    async fn resume(&self, binding: &str, workflow_id: &str) -> anyhow::Result<()>;

    async fn terminate(&self, binding: &str, workflow_id: &str) -> anyhow::Result<()>;
}

/// Notification from a running workflow to its instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowCallback {
    Progress {
        workflow_id: String,
        progress: Value,
    },
    Complete {
        workflow_id: String,
        #[serde(default)]
        result: Option<Value>,
    },
    Error {
        workflow_id: String,
        error: Value,
    },
    /// Custom event; never changes the tracking row.
    Event {
        workflow_id: String,
        event: Value,
    },
}

impl WorkflowCallback {
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::Progress { workflow_id, .. }
            | Self::Complete { workflow_id, .. }
            | Self::Error { workflow_id, .. }
            | Self::Event { workflow_id, .. } => workflow_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Event { .. } => "event",
        }
    }
}

/// Options for [`Instance::run_workflow`].
#[derive(Debug, Clone, Default)]
pub struct RunWorkflowOptions {
    /// Explicit workflow id; generated when absent.
    pub id: Option<String>,
    /// Caller metadata stored on the tracking row.
    pub metadata: Option<Value>,
}

impl<A: Agent> Instance<A> {
    fn engine(&self) -> Result<&Arc<dyn WorkflowEngine>, CoreError> {
        self.workflow_engine
            .as_ref()
            .ok_or_else(|| CoreError::WorkflowEngine {
                details: "no workflow engine configured".to_string(),
            })
    }

    async fn tracked_workflow(&self, workflow_id: &str) -> Result<WorkflowRecord, CoreError> {
        self.persistence
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| CoreError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    /// Start a workflow bound under `binding` and track it. Returns the
    /// workflow id.
    #[instrument(skip(self, params, options), fields(instance = %self.name()))]
    pub async fn run_workflow(
        &self,
        binding: &str,
        params: Value,
        options: RunWorkflowOptions,
    ) -> Result<String, CoreError> {
        let engine = self.engine()?;
        if !engine.has_binding(binding) {
            return Err(CoreError::BindingNotFound {
                binding: binding.to_string(),
            });
        }

        let workflow_id = options
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        self.persistence
            .insert_workflow(&WorkflowRecord {
                id: uuid::Uuid::new_v4().to_string(),
                workflow_id: workflow_id.clone(),
                binding: binding.to_string(),
                status: WorkflowStatus::Queued,
                metadata: options.metadata,
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            })
            .await?;

        if let Err(e) = engine.create(binding, &workflow_id, &params).await {
            warn!(workflow_id = %workflow_id, error = %e, "Workflow engine refused to start run");
            let error = Value::String(e.to_string());
            self.persistence
                .finish_workflow(&workflow_id, None, Some(&error))
                .await?;
            return Err(CoreError::WorkflowEngine {
                details: e.to_string(),
            });
        }

        info!(workflow_id = %workflow_id, binding, "Workflow started");
        Ok(workflow_id)
    }

    /// Apply an engine notification to the tracking row and run the hook.
    #[instrument(skip_all, fields(instance = %self.name(), workflow_id = %callback.workflow_id(), kind = callback.kind()))]
    pub async fn handle_workflow_callback(
        &self,
        callback: WorkflowCallback,
    ) -> Result<(), CoreError> {
        let hook = match &callback {
            WorkflowCallback::Progress {
                workflow_id,
                progress,
            } => {
                let row = self.tracked_workflow(workflow_id).await?;
                if row.status.is_terminal() {
                    debug!(status = %row.status, "Ignoring progress for finished workflow");
                    return Ok(());
                }
                if row.status != WorkflowStatus::Running {
                    self.persistence
                        .transition_workflow(workflow_id, WorkflowStatus::Running)
                        .await?;
                }
                self.agent()
                    .on_workflow_progress(self, workflow_id, progress)
                    .await
            }
            WorkflowCallback::Complete {
                workflow_id,
                result,
            } => {
                if !self.finish_tracked(workflow_id, result.as_ref(), None).await? {
                    return Ok(());
                }
                self.agent()
                    .on_workflow_complete(self, workflow_id, result.as_ref())
                    .await
            }
            WorkflowCallback::Error { workflow_id, error } => {
                if !self.finish_tracked(workflow_id, None, Some(error)).await? {
                    return Ok(());
                }
                self.agent()
                    .on_workflow_error(self, workflow_id, error)
                    .await
            }
            WorkflowCallback::Event { workflow_id, event } => {
                self.agent()
                    .on_workflow_event(self, workflow_id, event)
                    .await
            }
        };

        if let Err(e) = hook {
            self.agent().on_error(&e);
        }
        Ok(())
    }

    /// Returns false when the row was already terminal (a repeated
    /// notification), which is not an error.
    async fn finish_tracked(
        &self,
        workflow_id: &str,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> Result<bool, CoreError> {
        if self
            .persistence
            .finish_workflow(workflow_id, result, error)
            .await?
        {
            return Ok(true);
        }
        let row = self.tracked_workflow(workflow_id).await?;
        debug!(status = %row.status, "Workflow already finished");
        Ok(false)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, CoreError> {
        self.persistence.get_workflow(workflow_id).await
    }

    pub async fn list_workflows(
        &self,
        filter: &ListWorkflowsFilter,
    ) -> Result<Vec<WorkflowRecord>, CoreError> {
        self.persistence.list_workflows(filter).await
    }

    /// Forget a tracking row. The engine run, if any, is not touched.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, CoreError> {
        self.persistence.delete_workflow(workflow_id).await
    }

    /// Forget every tracking row matching the filter.
    pub async fn delete_workflows(&self, filter: &ListWorkflowsFilter) -> Result<u64, CoreError> {
        self.persistence.delete_workflows(filter).await
    }

    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<(), CoreError> {
        let row = self.active_workflow(workflow_id).await?;
        self.engine()?
            .pause(&row.binding, workflow_id)
            .await
            .map_err(engine_error)?;
        self.persistence
            .transition_workflow(workflow_id, WorkflowStatus::Paused)
            .await?;
        info!(instance = %self.name(), workflow_id, "Workflow paused");
        Ok(())
    }

    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<(), CoreError> {
        let row = self.active_workflow(workflow_id).await?;
        self.engine()?
            .resume(&row.binding, workflow_id)
            .await
            .map_err(engine_error)?;
        self.persistence
            .transition_workflow(workflow_id, WorkflowStatus::Running)
            .await?;
        info!(instance = %self.name(), workflow_id, "Workflow resumed");
        Ok(())
    }

    /// Stop a run and mark it errored.
    pub async fn terminate_workflow(&self, workflow_id: &str) -> Result<(), CoreError> {
        let row = self.active_workflow(workflow_id).await?;
        self.engine()?
            .terminate(&row.binding, workflow_id)
            .await
            .map_err(engine_error)?;
        let error = Value::String("terminated".to_string());
        self.persistence
            .finish_workflow(workflow_id, None, Some(&error))
            .await?;
        info!(instance = %self.name(), workflow_id, "Workflow terminated");
        Ok(())
    }

    async fn active_workflow(&self, workflow_id: &str) -> Result<WorkflowRecord, CoreError> {
        let row = self.tracked_workflow(workflow_id).await?;
        if row.status.is_terminal() {
            return Err(CoreError::WorkflowEngine {
                details: format!("workflow '{}' already {}", workflow_id, row.status),
            });
        }
        Ok(row)
    }

    /// Point every row tracked under `old` at `new`, e.g. after a workflow
    /// definition was renamed. `new` must be a known binding.
    pub async fn migrate_workflow_binding(&self, old: &str, new: &str) -> Result<u64, CoreError> {
        if !self.engine()?.has_binding(new) {
            return Err(CoreError::BindingNotFound {
                binding: new.to_string(),
            });
        }
        let moved = self.persistence.migrate_workflow_binding(old, new).await?;
        info!(instance = %self.name(), old, new, moved, "Workflow binding migrated");
        Ok(moved)
    }
}

fn engine_error(e: anyhow::Error) -> CoreError {
    CoreError::WorkflowEngine {
        details: e.to_string(),
    }
}

// ============================================================================
// Durable steps
// ============================================================================

/// Step primitive of a workflow engine: run `step` at most once under
/// `name` and return its (possibly cached) result.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(
        &self,
        name: &str,
        step: BoxFuture<'static, anyhow::Result<Value>>,
    ) -> anyhow::Result<Value>;
}

/// Step runner that checkpoints results in an instance store, keyed by
/// workflow id and step name.
pub struct CheckpointedSteps {
    workflow_id: String,
    persistence: Arc<dyn Persistence>,
}

impl CheckpointedSteps {
    pub fn new(workflow_id: impl Into<String>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            persistence,
        }
    }

    /// Run `f` unless a result for `name` is already recorded.
    pub async fn step<F, Fut>(&self, name: &str, f: F) -> anyhow::Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        if let Some(cached) = self.persistence.load_step(&self.workflow_id, name).await? {
            debug!(workflow_id = %self.workflow_id, step = name, "Step replayed from checkpoint");
            return Ok(cached);
        }

        let result = f().await?;
        self.persistence
            .save_step(&self.workflow_id, name, &result)
            .await?;
        Ok(result)
    }
}

#[async_trait]
impl StepRunner for CheckpointedSteps {
    async fn run_step(
        &self,
        name: &str,
        step: BoxFuture<'static, anyhow::Result<Value>>,
    ) -> anyhow::Result<Value> {
        self.step(name, || step).await
    }
}

/// Receiver of workflow callbacks.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn deliver(&self, callback: WorkflowCallback) -> anyhow::Result<()>;
}

#[async_trait]
impl CallbackSink for InstanceHandle {
    async fn deliver(&self, callback: WorkflowCallback) -> anyhow::Result<()> {
        Ok(self.workflow_callback(callback).await?)
    }
}

#[async_trait]
impl<A: Agent> CallbackSink for Instance<A> {
    async fn deliver(&self, callback: WorkflowCallback) -> anyhow::Result<()> {
        Ok(self.handle_workflow_callback(callback).await?)
    }
}

/// Notification helper handed to a running workflow.
pub struct WorkflowReporter<S> {
    workflow_id: String,
    steps: S,
    sink: Arc<dyn CallbackSink>,
}

impl<S: StepRunner> WorkflowReporter<S> {
    pub fn new(workflow_id: impl Into<String>, steps: S, sink: Arc<dyn CallbackSink>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            steps,
            sink,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    async fn notify(&self, step: String, callback: WorkflowCallback) -> anyhow::Result<()> {
        let sink = self.sink.clone();
        let delivery = async move {
            sink.deliver(callback).await?;
            Ok::<_, anyhow::Error>(Value::Bool(true))
        }
        .boxed();
        self.steps.run_step(&step, delivery).await?;
        Ok(())
    }

    /// Report progress. `step` names this report; reports with the same name
    /// are delivered once.
    pub async fn progress(&self, step: &str, progress: Value) -> anyhow::Result<()> {
        self.notify(
            format!("notify:progress:{}", step),
            WorkflowCallback::Progress {
                workflow_id: self.workflow_id.clone(),
                progress,
            },
        )
        .await
    }

    pub async fn complete(&self, result: Option<Value>) -> anyhow::Result<()> {
        self.notify(
            "notify:complete".to_string(),
            WorkflowCallback::Complete {
                workflow_id: self.workflow_id.clone(),
                result,
            },
        )
        .await
    }

    pub async fn error(&self, error: Value) -> anyhow::Result<()> {
        self.notify(
            "notify:error".to_string(),
            WorkflowCallback::Error {
                workflow_id: self.workflow_id.clone(),
                error,
            },
        )
        .await
    }

    pub async fn event(&self, step: &str, event: Value) -> anyhow::Result<()> {
        self.notify(
            format!("notify:event:{}", step),
            WorkflowCallback::Event {
                workflow_id: self.workflow_id.clone(),
                event,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::callable::MethodTable;
    use crate::config::InstanceConfig;
    use crate::persistence::SqlitePersistence;

    use super::*;

    #[derive(Default)]
    struct FakeEngine {
        bindings: HashSet<String>,
        calls: Mutex<Vec<String>>,
        refuse: bool,
    }

    impl FakeEngine {
        fn with(bindings: &[&str]) -> Self {
            Self {
                bindings: bindings.iter().map(|b| b.to_string()).collect(),
                ..Self::default()
            }
        }

        fn record(&self, call: String) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(call);
            if self.refuse {
                anyhow::bail!("engine unavailable");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WorkflowEngine for FakeEngine {
        fn has_binding(&self, binding: &str) -> bool {
            self.bindings.contains(binding)
        }

        async fn create(&self, binding: &str, workflow_id: &str, _params: &Value) -> anyhow::Result<()> {
            self.record(format!("create {binding} {workflow_id}"))
        }

        async fn pause(&self, _binding: &str, workflow_id: &str) -> anyhow::Result<()> {
            self.record(format!("pause {workflow_id}"))
        }

        async fn resume(&self, _binding: &str, workflow_id: &str) -> anyhow::Result<()> {
            self.record(format!("resume {workflow_id}"))
        }

        async fn terminate(&self, _binding: &str, workflow_id: &str) -> anyhow::Result<()> {
            self.record(format!("terminate {workflow_id}"))
        }
    }

    #[derive(Default)]
    struct Tracker {
        completions: AtomicUsize,
        events: AtomicUsize,
    }

    #[async_trait]
    impl Agent for Tracker {
        fn methods() -> MethodTable<Self> {
            MethodTable::new()
        }

        async fn on_workflow_complete(
            &self,
            _instance: &Instance<Self>,
            _workflow_id: &str,
            _result: Option<&Value>,
        ) -> anyhow::Result<()> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_workflow_event(
            &self,
            _instance: &Instance<Self>,
            _workflow_id: &str,
            _event: &Value,
        ) -> anyhow::Result<()> {
            self.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn instance(engine: FakeEngine) -> (Arc<Instance<Tracker>>, Arc<FakeEngine>) {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let engine = Arc::new(engine);
        let instance = Instance::new(
            "w",
            "tracker",
            Tracker::default(),
            persistence,
            InstanceConfig::default(),
        )
        .with_workflow_engine(engine.clone());
        (Arc::new(instance), engine)
    }

    fn with_id(id: &str) -> RunWorkflowOptions {
        RunWorkflowOptions {
            id: Some(id.to_string()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_run_workflow_tracks_and_rejects_duplicates() {
        let (instance, engine) = instance(FakeEngine::with(&["PROCESS"])).await;

        let id = instance
            .run_workflow("PROCESS", json!({"n": 1}), with_id("wf-1"))
            .await
            .unwrap();
        assert_eq!(id, "wf-1");
        let row = instance.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Queued);

        let err = instance
            .run_workflow("PROCESS", json!({}), with_id("wf-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateWorkflowId { .. }));
        assert_eq!(engine.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_binding_is_rejected() {
        let (instance, engine) = instance(FakeEngine::with(&["PROCESS"])).await;

        let err = instance
            .run_workflow("MISSING", json!({}), RunWorkflowOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BindingNotFound { .. }));
        assert!(engine.calls.lock().unwrap().is_empty());
        assert!(
            instance
                .list_workflows(&ListWorkflowsFilter::default())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_engine_failure_marks_row_errored() {
        let engine = FakeEngine {
            refuse: true,
            ..FakeEngine::with(&["PROCESS"])
        };
        let (instance, _) = instance(engine).await;

        let err = instance
            .run_workflow("PROCESS", json!({}), with_id("wf-x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WorkflowEngine { .. }));
        let row = instance.get_workflow("wf-x").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Errored);
    }

    #[tokio::test]
    async fn test_progress_never_regresses_terminal_row() {
        let (instance, _) = instance(FakeEngine::with(&["PROCESS"])).await;
        instance
            .run_workflow("PROCESS", json!({}), with_id("wf-2"))
            .await
            .unwrap();

        instance
            .handle_workflow_callback(WorkflowCallback::Progress {
                workflow_id: "wf-2".to_string(),
                progress: json!({"pct": 10}),
            })
            .await
            .unwrap();
        assert_eq!(
            instance.get_workflow("wf-2").await.unwrap().unwrap().status,
            WorkflowStatus::Running
        );

        let complete = WorkflowCallback::Complete {
            workflow_id: "wf-2".to_string(),
            result: Some(json!("ok")),
        };
        instance.handle_workflow_callback(complete.clone()).await.unwrap();
        instance.handle_workflow_callback(complete).await.unwrap();
        assert_eq!(instance.agent().completions.load(Ordering::SeqCst), 1);

        instance
            .handle_workflow_callback(WorkflowCallback::Progress {
                workflow_id: "wf-2".to_string(),
                progress: json!({"pct": 99}),
            })
            .await
            .unwrap();
        let row = instance.get_workflow("wf-2").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Complete);
        assert_eq!(row.result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_event_does_not_touch_row() {
        let (instance, _) = instance(FakeEngine::with(&["PROCESS"])).await;
        instance
            .run_workflow("PROCESS", json!({}), with_id("wf-3"))
            .await
            .unwrap();

        instance
            .handle_workflow_callback(WorkflowCallback::Event {
                workflow_id: "wf-3".to_string(),
                event: json!({"kind": "ping"}),
            })
            .await
            .unwrap();
        assert_eq!(instance.agent().events.load(Ordering::SeqCst), 1);
        assert_eq!(
            instance.get_workflow("wf-3").await.unwrap().unwrap().status,
            WorkflowStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_pause_resume_terminate() {
        let (instance, engine) = instance(FakeEngine::with(&["PROCESS"])).await;
        instance
            .run_workflow("PROCESS", json!({}), with_id("wf-4"))
            .await
            .unwrap();

        instance.pause_workflow("wf-4").await.unwrap();
        assert_eq!(
            instance.get_workflow("wf-4").await.unwrap().unwrap().status,
            WorkflowStatus::Paused
        );
        instance.resume_workflow("wf-4").await.unwrap();
        instance.terminate_workflow("wf-4").await.unwrap();

        let row = instance.get_workflow("wf-4").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Errored);
        assert_eq!(row.error, Some(json!("terminated")));
        assert!(instance.pause_workflow("wf-4").await.is_err());
        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec!["create PROCESS wf-4", "pause wf-4", "resume wf-4", "terminate wf-4"]
        );
    }

    #[tokio::test]
    async fn test_migrate_binding_requires_known_target() {
        let (instance, _) = instance(FakeEngine::with(&["OLD", "NEW"])).await;
        instance
            .run_workflow("OLD", json!({}), with_id("wf-5"))
            .await
            .unwrap();

        let err = instance
            .migrate_workflow_binding("OLD", "GONE")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BindingNotFound { .. }));

        assert_eq!(instance.migrate_workflow_binding("OLD", "NEW").await.unwrap(), 1);
        assert_eq!(
            instance.get_workflow("wf-5").await.unwrap().unwrap().binding,
            "NEW"
        );
    }

    #[tokio::test]
    async fn test_reporter_delivers_each_step_once() {
        let (instance, _) = instance(FakeEngine::with(&["PROCESS"])).await;
        instance
            .run_workflow("PROCESS", json!({}), with_id("wf-6"))
            .await
            .unwrap();

        let sink: Arc<dyn CallbackSink> = instance.clone();
        let steps = || CheckpointedSteps::new("wf-6", instance.persistence().clone());

        let reporter = WorkflowReporter::new("wf-6", steps(), sink.clone());
        reporter.event("hello", json!(1)).await.unwrap();
        reporter.complete(Some(json!("done"))).await.unwrap();

        // A replay of the same workflow re-runs the code but not the deliveries.
        let replayed = WorkflowReporter::new("wf-6", steps(), sink);
        replayed.event("hello", json!(1)).await.unwrap();
        replayed.complete(Some(json!("done"))).await.unwrap();

        assert_eq!(instance.agent().events.load(Ordering::SeqCst), 1);
        assert_eq!(instance.agent().completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_checkpointed_step_caches_result() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let steps = CheckpointedSteps::new("wf-7", persistence);
        let runs = AtomicUsize::new(0);

        for _ in 0..2 {
            let value = steps
                .step("fetch", || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(json!({"rows": 3}))
                })
                .await
                .unwrap();
            assert_eq!(value, json!({"rows": 3}));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
