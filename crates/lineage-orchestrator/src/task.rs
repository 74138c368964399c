//! The task entry point hosts invoke.
//!
//! [`ChildProcessTask::execute`] dispatches one action (`start`,
//! `start-external`, `fork`, `kill`) against the calling [`Execution`]. A
//! `start` with `sync` and `suspend` returns [`TaskOutcome::Suspended`]; the
//! host parks the execution and invokes the same action again when the resume
//! event fires, which picks up the pending suspension.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use lineage_client::{ProcessEntry, ProcessService};
use lineage_core::Settings;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregate::ResultAggregator;
use crate::bridge::{BridgeState, SuspendBridge};
use crate::connector::Connector;
use crate::error::{OrchestratorError, Result};
use crate::job::{Endpoint, JobConfig, JobConfigBuilder, Purpose, keys};
use crate::kill::{KillCoordinator, KillOutcome, parse_instance_ids};
use crate::launcher::{ProcessHandle, ProcessLauncher};
use crate::payload::{PayloadPackager, ZipPackager};
use crate::state::Execution;
use crate::waiter::{AggregateResult, CompletionWaiter, PollPolicy};

/// Task actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    StartExternal,
    Fork,
    Kill,
}

impl FromStr for Action {
    type Err = OrchestratorError;

    /// Case-insensitive; `start-external`, `start_external` and
    /// `startExternal` are the same action.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "start" => Ok(Self::Start),
            "startexternal" => Ok(Self::StartExternal),
            "fork" => Ok(Self::Fork),
            "kill" => Ok(Self::Kill),
            _ => Err(OrchestratorError::invalid(format!(
                "unsupported action: '{}'",
                s.trim()
            ))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::StartExternal => "start-external",
            Self::Fork => "fork",
            Self::Kill => "kill",
        })
    }
}

/// What a completed action produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    /// Processes launched by this call.
    pub handles: Vec<ProcessHandle>,
    /// Terminal snapshots of awaited processes.
    pub results: Option<AggregateResult>,
    /// Output variables per finished child, when requested.
    pub outputs: BTreeMap<Uuid, Map<String, Value>>,
    pub kills: Vec<KillOutcome>,
}

/// Result of [`ChildProcessTask::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskOutput),
    /// The host must park the execution until `resume_event` fires.
    Suspended { resume_event: String },
}

/// Everything one action needs, bound to one service.
struct Toolkit {
    service: Arc<dyn ProcessService>,
    launcher: ProcessLauncher,
    waiter: CompletionWaiter,
    bridge: SuspendBridge,
    killer: KillCoordinator,
    aggregator: ResultAggregator,
}

/// Child-process orchestration task.
pub struct ChildProcessTask {
    connector: Arc<dyn Connector>,
    packager: Arc<dyn PayloadPackager>,
    defaults: Map<String, Value>,
    poll: PollPolicy,
    kill_wait: Duration,
}

impl ChildProcessTask {
    pub fn new(connector: Arc<dyn Connector>, settings: &Settings) -> Self {
        Self {
            connector,
            packager: Arc::new(ZipPackager),
            defaults: settings.defaults.clone(),
            poll: PollPolicy::from_settings(&settings.wait),
            kill_wait: settings.wait.kill_wait_timeout(),
        }
    }

    #[must_use]
    pub fn with_packager(mut self, packager: Arc<dyn PayloadPackager>) -> Self {
        self.packager = packager;
        self
    }

    fn toolkit(&self, endpoint: &Endpoint) -> Result<Toolkit> {
        let service = self.connector.connect(endpoint)?;
        let waiter = CompletionWaiter::new(Arc::clone(&service), self.poll);
        Ok(Toolkit {
            launcher: ProcessLauncher::with_packager(
                Arc::clone(&service),
                Arc::clone(&self.packager),
            ),
            bridge: SuspendBridge::new(Arc::clone(&service), waiter.clone()),
            killer: KillCoordinator::new(Arc::clone(&service), waiter.clone())
                .with_wait_timeout(self.kill_wait),
            aggregator: ResultAggregator::new(Arc::clone(&service)),
            waiter,
            service,
        })
    }

    fn builder(&self, params: &Map<String, Value>) -> JobConfigBuilder {
        JobConfigBuilder::new().defaults(&self.defaults).params(params)
    }

    /// Run `action` on behalf of `execution`.
    pub async fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        execution: &mut Execution,
    ) -> Result<TaskOutcome> {
        let action: Action = action.parse()?;
        info!(%action, instance_id = %execution.instance_id, "Executing task");
        match action {
            Action::Start => self.start(params, execution, false).await,
            Action::StartExternal => self.start(params, execution, true).await,
            Action::Fork => self.fork(params, execution).await,
            Action::Kill => self.kill(params).await,
        }
    }

    async fn start(
        &self,
        params: &Map<String, Value>,
        execution: &mut Execution,
        external: bool,
    ) -> Result<TaskOutcome> {
        if BridgeState::of(&execution.state) == BridgeState::Suspended {
            let cfg = self.builder(params).build(Purpose::Control)?;
            return self.continue_after_suspend(&cfg, execution).await;
        }

        let mut builder = self.builder(params);
        if !external {
            builder = builder.parent(execution.instance_id);
        }
        let cfg = builder.build(Purpose::Start)?;
        if external && cfg.endpoint.api_key.is_none() {
            return Err(OrchestratorError::invalid(format!(
                "'{}' is required to start a process on an external server",
                keys::API_KEY
            )));
        }

        let kit = self.toolkit(&cfg.endpoint)?;
        let handle = match cfg.parent_instance_id {
            Some(parent) => kit.launcher.start_child(&cfg, parent, execution).await?,
            None => kit.launcher.start_new(&cfg, execution).await?,
        };

        if !cfg.sync {
            return Ok(TaskOutcome::Completed(TaskOutput {
                handles: vec![handle],
                ..TaskOutput::default()
            }));
        }

        if cfg.suspend {
            info!(instance_id = %handle.id, "Suspending until the child process is completed");
            return kit
                .bridge
                .suspend(execution.instance_id, &[handle.id], &mut execution.state)
                .await;
        }

        let results = kit.waiter.await_all(&[handle.id], timeout(&cfg)).await?;
        let mut output = Self::publish(&kit, &cfg, results, handle.id, execution).await?;
        output.handles = vec![handle];
        Ok(TaskOutcome::Completed(output))
    }

    async fn continue_after_suspend(
        &self,
        cfg: &JobConfig,
        execution: &mut Execution,
    ) -> Result<TaskOutcome> {
        let kit = self.toolkit(&cfg.endpoint)?;
        let first = execution
            .state
            .pending_suspension()
            .and_then(|r| r.wait_set.first().copied())
            .ok_or_else(|| OrchestratorError::invalid("suspension has an empty wait set"))?;

        let results = kit.bridge.resume(&mut execution.state, timeout(cfg)).await?;
        let output = Self::publish(&kit, cfg, results, first, execution).await?;
        Ok(TaskOutcome::Completed(output))
    }

    /// Classify results and store the output of `child` as `jobOut`.
    async fn publish(
        kit: &Toolkit,
        cfg: &JobConfig,
        results: AggregateResult,
        child: Uuid,
        execution: &mut Execution,
    ) -> Result<TaskOutput> {
        let outputs = kit
            .aggregator
            .aggregate(&results, cfg.ignore_failures, cfg.out_vars.is_some())
            .await?;
        execution.state.job_out = Some(outputs.get(&child).cloned().unwrap_or_default());
        Ok(TaskOutput {
            results: Some(results),
            outputs,
            ..TaskOutput::default()
        })
    }

    async fn fork(
        &self,
        params: &Map<String, Value>,
        execution: &mut Execution,
    ) -> Result<TaskOutcome> {
        let builder = self.builder(params);
        let merged = builder.merged();

        let specs = match merged.get(keys::FORKS) {
            None | Some(Value::Null) => vec![builder.clone().build(Purpose::Fork)?],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(spec) => builder.clone().overrides(spec).build(Purpose::Fork),
                    other => Err(OrchestratorError::invalid(format!(
                        "'{}' entries must be mappings: {other}",
                        keys::FORKS
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(OrchestratorError::invalid(format!(
                    "'{}' must be a list of mappings: {other}",
                    keys::FORKS
                )));
            }
        };

        let endpoint = builder.build(Purpose::Control)?.endpoint;
        let kit = self.toolkit(&endpoint)?;
        let handles = kit
            .launcher
            .fork(execution.instance_id, &specs, &mut execution.state)
            .await?;

        Ok(TaskOutcome::Completed(TaskOutput {
            handles,
            ..TaskOutput::default()
        }))
    }

    async fn kill(&self, params: &Map<String, Value>) -> Result<TaskOutcome> {
        let builder = self.builder(params);
        let ids = parse_instance_ids(
            builder
                .merged()
                .get(keys::INSTANCE_ID)
                .unwrap_or(&Value::Null),
        )?;
        let cfg = builder.build(Purpose::Control)?;
        let kit = self.toolkit(&cfg.endpoint)?;
        let kills = kit.killer.kill_many(&ids, cfg.sync).await?;

        Ok(TaskOutcome::Completed(TaskOutput {
            kills,
            ..TaskOutput::default()
        }))
    }

    /// Children of `parent_id`, optionally filtered by tags.
    pub async fn list_subprocesses(
        &self,
        parent_id: Uuid,
        tags: &[String],
    ) -> Result<Vec<ProcessEntry>> {
        let kit = self.toolkit(&Endpoint::default())?;
        let children = kit
            .service
            .list_children(parent_id, tags)
            .await
            .map_err(|e| OrchestratorError::remote("listSubprocesses", e))?;
        debug!(parent_id = %parent_id, count = children.len(), "Listed subprocesses");
        Ok(children)
    }

    /// Block until every identifier is terminal.
    pub async fn wait_for_completion(
        &self,
        ids: &[Uuid],
        timeout: Option<Duration>,
    ) -> Result<AggregateResult> {
        let kit = self.toolkit(&Endpoint::default())?;
        kit.waiter.await_all(ids, timeout).await
    }
}

fn timeout(cfg: &JobConfig) -> Option<Duration> {
    cfg.timeout_ms.map(Duration::from_millis)
}
