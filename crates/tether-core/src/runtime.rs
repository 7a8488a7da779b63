// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable agent runtime.
//!
//! This module provides [`AgentRuntime`], a registry of agent types and the
//! instances currently alive. Instances are created on first use, each with
//! its own SQLite database under `<data_dir>/<agent>/<name>.db`, and stop on
//! their own once idle. An instance that stopped is recreated (rehydrated
//! from its database) the next time it is addressed.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::runtime::AgentRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = AgentRuntime::builder()
//!         .data_dir(".data")
//!         .agent("counter", || Counter)
//!         .build()?;
//!
//!     // Wake instances with pending alarms.
//!     runtime.restore().await?;
//!
//!     let counter = runtime.instance("counter", "main").await?;
//!     counter.call("increment", vec![]).await?;
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::config::{Config, InstanceConfig};
use crate::error::CoreError;
use crate::instance::{Instance, InstanceHandle};
use crate::persistence::{Persistence, SqlitePersistence};
use crate::workflow::WorkflowEngine;

struct SpawnArgs {
    name: String,
    agent_type: String,
    persistence: Arc<dyn Persistence>,
    config: InstanceConfig,
    idle_timeout: Option<Duration>,
    engine: Option<Arc<dyn WorkflowEngine>>,
}

type Spawner =
    Arc<dyn Fn(SpawnArgs) -> BoxFuture<'static, Result<InstanceHandle, CoreError>> + Send + Sync>;

fn spawner<A, F>(factory: F) -> Spawner
where
    A: Agent,
    F: Fn() -> A + Send + Sync + 'static,
{
    let factory = Arc::new(factory);
    Arc::new(move |args: SpawnArgs| {
        let factory = factory.clone();
        async move {
            let mut instance = Instance::new(
                args.name,
                args.agent_type,
                factory(),
                args.persistence,
                args.config,
            );
            if let Some(engine) = args.engine {
                instance = instance.with_workflow_engine(engine);
            }
            let instance = Arc::new(instance);
            instance.start().await?;
            Ok::<_, CoreError>(instance.spawn(args.idle_timeout))
        }
        .boxed()
    })
}

/// Builder for creating an [`AgentRuntime`].
pub struct AgentRuntimeBuilder {
    data_dir: Option<PathBuf>,
    instance_config: InstanceConfig,
    idle_timeout: Option<Duration>,
    engine: Option<Arc<dyn WorkflowEngine>>,
    agents: HashMap<String, Spawner>,
}

impl std::fmt::Debug for AgentRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut agents: Vec<&String> = self.agents.keys().collect();
        agents.sort();
        f.debug_struct("AgentRuntimeBuilder")
            .field("data_dir", &self.data_dir)
            .field("instance_config", &self.instance_config)
            .field("idle_timeout", &self.idle_timeout)
            .field("engine", &self.engine.as_ref().map(|_| "..."))
            .field("agents", &agents)
            .finish()
    }
}

impl Default for AgentRuntimeBuilder {
    fn default() -> Self {
        Self {
            data_dir: None,
            instance_config: InstanceConfig::default(),
            idle_timeout: None,
            engine: None,
            agents: HashMap::new(),
        }
    }
}

impl AgentRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-filled from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .data_dir(config.data_dir.clone())
            .idle_timeout(config.idle_timeout)
            .instance_config(config.instance.clone())
    }

    /// Directory for instance databases.
    ///
    /// Default: none, every instance gets an in-memory database.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Stop instances that have been idle this long.
    ///
    /// Default: never.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn instance_config(mut self, config: InstanceConfig) -> Self {
        self.instance_config = config;
        self
    }

    /// Engine handed to every instance for `run_workflow`.
    pub fn workflow_engine(mut self, engine: Arc<dyn WorkflowEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Register an agent type under `name`. `factory` builds the agent value
    /// for each new instance.
    pub fn agent<A, F>(mut self, name: &str, factory: F) -> Self
    where
        A: Agent,
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.agents.insert(name.to_string(), spawner(factory));
        self
    }

    /// Build the runtime.
    ///
    /// Returns an error if no agent type is registered.
    pub fn build(self) -> Result<AgentRuntime> {
        if self.agents.is_empty() {
            anyhow::bail!("at least one agent type is required");
        }

        Ok(AgentRuntime {
            inner: Arc::new(RuntimeInner {
                data_dir: self.data_dir,
                instance_config: self.instance_config,
                idle_timeout: self.idle_timeout,
                engine: self.engine,
                agents: self.agents,
                instances: Mutex::new(HashMap::new()),
            }),
        })
    }
}

struct RuntimeInner {
    data_dir: Option<PathBuf>,
    instance_config: InstanceConfig,
    idle_timeout: Option<Duration>,
    engine: Option<Arc<dyn WorkflowEngine>>,
    agents: HashMap<String, Spawner>,
    instances: Mutex<HashMap<(String, String), InstanceHandle>>,
}

/// Registry of agent types and live instances.
///
/// Cheap to clone; clones share the same instances.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("data_dir", &self.inner.data_dir)
            .field("agents", &self.agent_types())
            .finish()
    }
}

/// Instance names double as file names.
fn validate_name(name: &str) -> Result<(), CoreError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidInstanceName {
            name: name.to_string(),
        })
    }
}

impl AgentRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new()
    }

    pub fn has_agent(&self, agent: &str) -> bool {
        self.inner.agents.contains_key(agent)
    }

    /// Registered agent type names, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.inner.data_dir.as_deref()
    }

    /// Address of the instance `name` of `agent`, starting it if needed.
    pub async fn instance(&self, agent: &str, name: &str) -> Result<InstanceHandle, CoreError> {
        let spawn = self
            .inner
            .agents
            .get(agent)
            .ok_or_else(|| CoreError::UnknownAgent {
                agent: agent.to_string(),
            })?
            .clone();
        validate_name(name)?;

        let key = (agent.to_string(), name.to_string());
        let mut instances = self.inner.instances.lock().await;
        if let Some(handle) = instances.get(&key) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            debug!(agent, name, "Instance stopped, recreating");
        }

        let persistence = self.open_store(agent, name).await?;
        let handle = spawn(SpawnArgs {
            name: name.to_string(),
            agent_type: agent.to_string(),
            persistence,
            config: self.inner.instance_config.clone(),
            idle_timeout: self.inner.idle_timeout,
            engine: self.inner.engine.clone(),
        })
        .await?;

        info!(agent, name, "Instance started");
        instances.insert(key, handle.clone());
        Ok(handle)
    }

    async fn open_store(&self, agent: &str, name: &str) -> Result<Arc<dyn Persistence>, CoreError> {
        let persistence = match &self.inner.data_dir {
            Some(dir) => {
                SqlitePersistence::from_path(dir.join(agent).join(format!("{}.db", name))).await?
            }
            None => SqlitePersistence::in_memory().await?,
        };
        Ok(Arc::new(persistence))
    }

    /// Start every stored instance that has an armed alarm, so pending jobs
    /// run without waiting for a client. Returns the number started.
    pub async fn restore(&self) -> Result<usize, CoreError> {
        let Some(dir) = self.inner.data_dir.clone() else {
            return Ok(0);
        };

        let mut started = 0;
        for agent in self.agent_types() {
            let agent_dir = dir.join(&agent);
            let Ok(entries) = std::fs::read_dir(&agent_dir) else {
                continue;
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("db") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };

                let store = SqlitePersistence::from_path(&path).await?;
                let alarm = store.get_alarm().await?;
                store.pool().close().await;
                if alarm.is_none() {
                    continue;
                }

                match self.instance(&agent, name).await {
                    Ok(_) => started += 1,
                    Err(e) => warn!(agent = %agent, name, error = %e, "Failed to restore instance"),
                }
            }
        }

        info!(started, "Restored instances with pending alarms");
        Ok(started)
    }

    /// Live instances as `(agent, name)` pairs.
    pub async fn live_instances(&self) -> Vec<(String, String)> {
        let instances = self.inner.instances.lock().await;
        let mut live: Vec<(String, String)> = instances
            .iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(key, _)| key.clone())
            .collect();
        live.sort();
        live
    }

    /// Ask every live instance to stop and wait until they have.
    pub async fn shutdown(&self) {
        info!("AgentRuntime shutting down...");
        let handles: Vec<InstanceHandle> = {
            let mut instances = self.inner.instances.lock().await;
            instances.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            handle.shutdown();
        }
        for handle in &handles {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        info!("AgentRuntime shutdown complete");
    }
}
