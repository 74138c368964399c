//! In-memory process service for tests.
//!
//! [`FakeProcessService`] keeps a table of scripted processes. A process has a
//! current status and, optionally, a transition to another status at a given
//! (tokio) instant, so tests running with paused time can model processes
//! that finish "later". Every call is recorded for assertions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lineage_client::{
    ClientError, ProcessEntry, ProcessRequest, ProcessService, ProcessStatus,
    StartProcessResponse, SubmitRequest, WaitCondition,
};
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct FakeProcess {
    status: ProcessStatus,
    transition: Option<(ProcessStatus, Instant)>,
    parent: Option<Uuid>,
    tags: Option<Vec<String>>,
    meta: Option<Map<String, Value>>,
    output: Option<Vec<u8>>,
}

impl FakeProcess {
    fn new(status: ProcessStatus) -> Self {
        Self {
            status,
            transition: None,
            parent: None,
            tags: None,
            meta: None,
            output: None,
        }
    }

    fn current(&self, now: Instant) -> ProcessStatus {
        match self.transition {
            Some((status, at)) if now >= at => status,
            _ => self.status,
        }
    }
}

/// What a process started through `submit`/`fork` does.
#[derive(Debug, Clone, Copy)]
struct LaunchScript {
    status: ProcessStatus,
    after: Duration,
}

#[derive(Debug, Default)]
struct LaunchExtras {
    error: Option<String>,
    output: Option<Vec<u8>>,
}

#[derive(Debug)]
struct FakeState {
    processes: HashMap<Uuid, FakeProcess>,
    launch: LaunchScript,
    extras: LaunchExtras,
    /// `None` = a kill never takes effect.
    kill_delays: HashMap<Uuid, Option<Duration>>,
    status_failures: HashMap<Uuid, u32>,
    fail_submits: bool,
    status_calls: HashMap<Uuid, usize>,
    launched: Vec<Uuid>,
    submitted: Vec<SubmitRequest>,
    forks: Vec<(Uuid, ProcessRequest, bool)>,
    killed: Vec<Uuid>,
    wait_conditions: Vec<(Uuid, WaitCondition)>,
}

/// Scripted in-memory [`ProcessService`].
#[derive(Debug)]
pub struct FakeProcessService {
    state: Mutex<FakeState>,
}

impl Default for FakeProcessService {
    fn default() -> Self {
        Self::new()
    }
}

fn error_meta(message: &str) -> Map<String, Value> {
    let mut last_error = Map::new();
    last_error.insert("message".into(), json!(message));
    let mut out = Map::new();
    out.insert("lastError".into(), Value::Object(last_error));
    let mut meta = Map::new();
    meta.insert("out".into(), Value::Object(out));
    meta
}

fn not_found(id: Uuid) -> ClientError {
    ClientError::Api {
        status: 404,
        message: format!("Process instance not found: {id}"),
    }
}

impl FakeProcessService {
    /// Launched processes finish immediately unless scripted otherwise.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                processes: HashMap::new(),
                launch: LaunchScript {
                    status: ProcessStatus::Finished,
                    after: Duration::ZERO,
                },
                extras: LaunchExtras::default(),
                kill_delays: HashMap::new(),
                status_failures: HashMap::new(),
                fail_submits: false,
                status_calls: HashMap::new(),
                launched: Vec::new(),
                submitted: Vec::new(),
                forks: Vec::new(),
                killed: Vec::new(),
                wait_conditions: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- scripting ------------------------------------------------------------

    /// Add a process that stays in `status`.
    pub fn add_process(&self, status: ProcessStatus) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().processes.insert(id, FakeProcess::new(status));
        id
    }

    /// Add a process that is `RUNNING` now and reaches `status` after `after`.
    pub fn add_scripted(&self, status: ProcessStatus, after: Duration) -> Uuid {
        let id = Uuid::new_v4();
        let mut process = FakeProcess::new(ProcessStatus::Running);
        process.transition = Some((status, Instant::now() + after));
        self.lock().processes.insert(id, process);
        id
    }

    /// Script processes launched from now on.
    pub fn on_launch(&self, status: ProcessStatus, after: Duration) {
        self.lock().launch = LaunchScript { status, after };
    }

    /// Error detail carried by processes launched from now on.
    pub fn on_launch_error(&self, message: &str) {
        self.lock().extras.error = Some(message.to_string());
    }

    /// `out.json` of processes launched from now on.
    pub fn on_launch_output(&self, output: &Value) {
        self.lock().extras.output = Some(output.to_string().into_bytes());
    }

    /// Record `meta.out.lastError.message` on a process.
    pub fn set_error(&self, id: Uuid, message: &str) {
        if let Some(p) = self.lock().processes.get_mut(&id) {
            p.meta = Some(error_meta(message));
        }
    }

    /// Give a process an `out.json` attachment.
    pub fn set_output(&self, id: Uuid, output: &Value) {
        if let Some(p) = self.lock().processes.get_mut(&id) {
            p.output = Some(output.to_string().into_bytes());
        }
    }

    /// Give a process an attachment with arbitrary bytes.
    pub fn set_raw_output(&self, id: Uuid, bytes: &[u8]) {
        if let Some(p) = self.lock().processes.get_mut(&id) {
            p.output = Some(bytes.to_vec());
        }
    }

    pub fn set_parent(&self, id: Uuid, parent: Uuid, tags: &[&str]) {
        if let Some(p) = self.lock().processes.get_mut(&id) {
            p.parent = Some(parent);
            p.tags = Some(tags.iter().map(ToString::to_string).collect());
        }
    }

    /// How long a kill of `id` takes to cancel the process (`None` = never).
    pub fn kill_delay(&self, id: Uuid, delay: Option<Duration>) {
        self.lock().kill_delays.insert(id, delay);
    }

    /// Make the next `n` status queries of `id` fail with a 503.
    pub fn fail_status_calls(&self, id: Uuid, n: u32) {
        self.lock().status_failures.insert(id, n);
    }

    pub fn fail_submits(&self) {
        self.lock().fail_submits = true;
    }

    /// Force the status of an existing process.
    pub fn set_status(&self, id: Uuid, status: ProcessStatus) {
        if let Some(p) = self.lock().processes.get_mut(&id) {
            p.status = status;
            p.transition = None;
        }
    }

    // -- inspection -----------------------------------------------------------

    pub fn status_calls(&self, id: Uuid) -> usize {
        self.lock().status_calls.get(&id).copied().unwrap_or(0)
    }

    /// Identifiers assigned by `submit`/`fork`, in order.
    pub fn launched(&self) -> Vec<Uuid> {
        self.lock().launched.clone()
    }

    pub fn submitted(&self) -> Vec<SubmitRequest> {
        self.lock().submitted.clone()
    }

    pub fn forks(&self) -> Vec<(Uuid, ProcessRequest, bool)> {
        self.lock().forks.clone()
    }

    pub fn killed(&self) -> Vec<Uuid> {
        self.lock().killed.clone()
    }

    pub fn wait_conditions(&self) -> Vec<(Uuid, WaitCondition)> {
        self.lock().wait_conditions.clone()
    }

    fn launch(state: &mut FakeState, parent: Option<Uuid>, tags: Option<Vec<String>>) -> Uuid {
        let id = Uuid::new_v4();
        let script = state.launch;
        let mut process = FakeProcess::new(ProcessStatus::Running);
        if script.after.is_zero() {
            process.status = script.status;
        } else {
            process.transition = Some((script.status, Instant::now() + script.after));
        }
        process.parent = parent;
        process.tags = tags;
        process.meta = state.extras.error.as_deref().map(error_meta);
        process.output.clone_from(&state.extras.output);
        state.processes.insert(id, process);
        state.launched.push(id);
        id
    }
}

#[async_trait]
impl ProcessService for FakeProcessService {
    async fn submit(&self, request: SubmitRequest) -> Result<StartProcessResponse, ClientError> {
        let mut state = self.lock();
        if state.fail_submits {
            return Err(ClientError::Api {
                status: 500,
                message: "submit rejected".into(),
            });
        }
        let id = Self::launch(
            &mut state,
            request.parent_instance_id,
            request.request.tags.clone(),
        );
        state.submitted.push(request);
        Ok(StartProcessResponse { instance_id: id })
    }

    async fn fork(
        &self,
        parent: Uuid,
        request: &ProcessRequest,
        sync: bool,
    ) -> Result<StartProcessResponse, ClientError> {
        let mut state = self.lock();
        if state.fail_submits {
            return Err(ClientError::Api {
                status: 500,
                message: "fork rejected".into(),
            });
        }
        let id = Self::launch(&mut state, Some(parent), request.tags.clone());
        state.forks.push((parent, request.clone(), sync));
        Ok(StartProcessResponse { instance_id: id })
    }

    async fn get_status(&self, id: Uuid) -> Result<ProcessEntry, ClientError> {
        let mut state = self.lock();
        *state.status_calls.entry(id).or_insert(0) += 1;
        if let Some(remaining) = state.status_failures.get_mut(&id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ClientError::Api {
                status: 503,
                message: "Service Unavailable".into(),
            });
        }
        let process = state.processes.get(&id).ok_or_else(|| not_found(id))?;
        Ok(ProcessEntry {
            instance_id: id,
            status: process.current(Instant::now()),
            parent_instance_id: process.parent,
            tags: process.tags.clone(),
            meta: process.meta.clone(),
        })
    }

    async fn list_children(
        &self,
        id: Uuid,
        tags: &[String],
    ) -> Result<Vec<ProcessEntry>, ClientError> {
        let state = self.lock();
        let now = Instant::now();
        let mut children: Vec<ProcessEntry> = state
            .processes
            .iter()
            .filter(|(_, p)| p.parent == Some(id))
            .filter(|(_, p)| {
                tags.iter()
                    .all(|t| p.tags.as_ref().is_some_and(|own| own.contains(t)))
            })
            .map(|(child, p)| ProcessEntry {
                instance_id: *child,
                status: p.current(now),
                parent_instance_id: p.parent,
                tags: p.tags.clone(),
                meta: p.meta.clone(),
            })
            .collect();
        children.sort_by_key(|e| e.instance_id);
        Ok(children)
    }

    async fn kill(&self, id: Uuid) -> Result<(), ClientError> {
        let mut state = self.lock();
        let delay = state
            .kill_delays
            .get(&id)
            .copied()
            .unwrap_or(Some(Duration::ZERO));
        let now = Instant::now();
        let process = state.processes.get_mut(&id).ok_or_else(|| not_found(id))?;
        if !process.current(now).is_terminal()
            && let Some(delay) = delay
        {
            process.transition = Some((ProcessStatus::Cancelled, now + delay));
        }
        state.killed.push(id);
        Ok(())
    }

    async fn set_wait_condition(
        &self,
        id: Uuid,
        condition: &WaitCondition,
    ) -> Result<(), ClientError> {
        self.lock().wait_conditions.push((id, condition.clone()));
        Ok(())
    }

    async fn download_output_artifact(
        &self,
        id: Uuid,
        _name: &str,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let state = self.lock();
        let process = state.processes.get(&id).ok_or_else(|| not_found(id))?;
        Ok(process.output.clone())
    }
}
