//! Process launcher.
//!
//! Submits new, child and forked processes. Launches are never retried: a
//! failed submission surfaces as [`OrchestratorError::RemoteCallFailed`].

use std::path::Path;
use std::sync::Arc;

use lineage_client::{ProcessService, ProcessStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::JobConfig;
use crate::payload::{self, PayloadPackager, ZipPackager};
use crate::request::{to_process_request, to_submit_request};
use crate::state::{Execution, ExecutionState};

/// Identifier of a launched process plus its last-known status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub id: Uuid,
    pub status: ProcessStatus,
}

impl ProcessHandle {
    /// Handle of a process that was just submitted.
    pub const fn submitted(id: Uuid) -> Self {
        Self {
            id,
            status: ProcessStatus::Running,
        }
    }
}

/// Starts and forks processes.
#[derive(Clone)]
pub struct ProcessLauncher {
    service: Arc<dyn ProcessService>,
    packager: Arc<dyn PayloadPackager>,
}

impl ProcessLauncher {
    pub fn new(service: Arc<dyn ProcessService>) -> Self {
        Self::with_packager(service, Arc::new(ZipPackager))
    }

    pub fn with_packager(
        service: Arc<dyn ProcessService>,
        packager: Arc<dyn PayloadPackager>,
    ) -> Self {
        Self { service, packager }
    }

    /// Start a process with no parent.
    pub async fn start_new(
        &self,
        cfg: &JobConfig,
        execution: &mut Execution,
    ) -> Result<ProcessHandle> {
        if let Some(parent) = cfg.parent_instance_id {
            return Err(OrchestratorError::invalid(format!(
                "a new process can't have a parent, got {parent}"
            )));
        }
        self.submit(cfg, execution).await
    }

    /// Start a process recorded as a child of `parent_id`. A configuration
    /// built without a parent is adopted by `parent_id`.
    pub async fn start_child(
        &self,
        cfg: &JobConfig,
        parent_id: Uuid,
        execution: &mut Execution,
    ) -> Result<ProcessHandle> {
        match cfg.parent_instance_id {
            Some(parent) if parent != parent_id => Err(OrchestratorError::invalid(format!(
                "configuration names parent {parent}, not {parent_id}"
            ))),
            Some(_) => self.submit(cfg, execution).await,
            None => {
                let cfg = JobConfig {
                    parent_instance_id: Some(parent_id),
                    ..cfg.clone()
                };
                self.submit(&cfg, execution).await
            }
        }
    }

    async fn submit(&self, cfg: &JobConfig, execution: &mut Execution) -> Result<ProcessHandle> {
        if cfg.payload.is_none() && !cfg.target.is_resolvable() {
            return Err(OrchestratorError::invalid(
                "'payload' and/or 'project' are required",
            ));
        }

        let archive = match &cfg.payload {
            Some(p) => Some(self.package(&payload::resolve(&execution.work_dir, p)).await?),
            None => None,
        };

        let request = to_submit_request(cfg, archive, execution.org.as_deref());
        debug!(
            entry_point = ?request.request.entry_point,
            project = ?request.project,
            has_archive = request.archive.is_some(),
            "Submitting process"
        );

        let resp = self
            .service
            .submit(request)
            .await
            .map_err(|e| OrchestratorError::remote("submit", e))?;

        let id = resp.instance_id;
        if let Some(parent) = cfg.parent_instance_id {
            info!(instance_id = %id, parent_id = %parent, "Started a child process");
        } else {
            info!(instance_id = %id, base_url = ?cfg.endpoint.base_url, "Started a process");
        }

        execution.state.jobs = vec![id];
        Ok(ProcessHandle::submitted(id))
    }

    async fn package(&self, path: &Path) -> Result<Vec<u8>> {
        let packager = Arc::clone(&self.packager);
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || packager.package(&owned))
            .await
            .map_err(|e| OrchestratorError::Payload {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
    }

    /// Fork `parent_id` once per instance of every specification.
    pub async fn fork(
        &self,
        parent_id: Uuid,
        specs: &[JobConfig],
        state: &mut ExecutionState,
    ) -> Result<Vec<ProcessHandle>> {
        if specs.is_empty() {
            return Err(OrchestratorError::invalid("'forks' can't be an empty list"));
        }
        if specs.iter().any(|s| s.entry_point.is_none()) {
            return Err(OrchestratorError::invalid("'entryPoint' is required"));
        }

        let mut handles = Vec::new();
        for spec in specs {
            let request = to_process_request(spec);
            for _ in 0..spec.instances {
                info!(
                    parent_id = %parent_id,
                    sync = spec.sync,
                    entry_point = ?request.entry_point,
                    "Forking the current instance"
                );
                let resp = self
                    .service
                    .fork(parent_id, &request, spec.sync)
                    .await
                    .map_err(|e| OrchestratorError::remote("fork", e))?;
                info!(instance_id = %resp.instance_id, "Forked a child process");
                handles.push(ProcessHandle::submitted(resp.instance_id));
            }
        }

        state.jobs = handles.iter().map(|h| h.id).collect();
        Ok(handles)
    }
}
