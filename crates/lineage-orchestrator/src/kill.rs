//! Kill coordinator.
//!
//! Cancels processes and optionally waits, with its own bounded timeout, for
//! the cancellation to be confirmed. Unlike an ordinary wait, the kill has
//! already been accepted at that point, so running out of time or failing to
//! read the status is only a warning.

use std::sync::Arc;
use std::time::Duration;

use lineage_client::{ProcessService, ProcessStatus};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::keys;
use crate::waiter::CompletionWaiter;

/// Default bound of the post-kill wait.
pub const DEFAULT_KILL_WAIT: Duration = Duration::from_secs(10);

/// What happened to one killed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillOutcome {
    pub id: Uuid,
    /// Terminal status observed after the kill, if it was awaited in time.
    pub status: Option<ProcessStatus>,
    /// The bounded post-kill wait ran out before a terminal status was seen.
    pub wait_timed_out: bool,
    /// The post-kill wait could not read the status.
    pub wait_error: Option<String>,
}

#[derive(Clone)]
pub struct KillCoordinator {
    service: Arc<dyn ProcessService>,
    waiter: CompletionWaiter,
    wait_timeout: Duration,
}

impl KillCoordinator {
    pub fn new(service: Arc<dyn ProcessService>, waiter: CompletionWaiter) -> Self {
        Self {
            service,
            waiter,
            wait_timeout: DEFAULT_KILL_WAIT,
        }
    }

    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Kill one process. With `sync`, wait at most the kill-wait bound for
    /// it to become terminal.
    pub async fn kill_one(&self, id: Uuid, sync: bool) -> Result<KillOutcome> {
        self.service
            .kill(id)
            .await
            .map_err(|e| OrchestratorError::remote("kill", e))?;
        info!(instance_id = %id, sync, "Kill requested");

        let mut outcome = KillOutcome {
            id,
            status: None,
            wait_timed_out: false,
            wait_error: None,
        };
        if !sync {
            return Ok(outcome);
        }

        match self.waiter.await_one(id, Some(self.wait_timeout)).await {
            Ok(entry) => outcome.status = Some(entry.status),
            Err(OrchestratorError::WaitTimeout { elapsed, .. }) => {
                warn!(
                    instance_id = %id,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Process did not stop in time after kill"
                );
                outcome.wait_timed_out = true;
            }
            Err(e) => {
                warn!(
                    instance_id = %id,
                    error = %e,
                    "Could not confirm process stopped after kill"
                );
                outcome.wait_error = Some(e.to_string());
            }
        }
        Ok(outcome)
    }

    /// Kill every process in `ids`, in order.
    pub async fn kill_many(&self, ids: &[Uuid], sync: bool) -> Result<Vec<KillOutcome>> {
        if ids.is_empty() {
            return Err(OrchestratorError::invalid(format!(
                "'{}' should be a single value or an array of values",
                keys::INSTANCE_ID
            )));
        }

        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            outcomes.push(self.kill_one(id, sync).await?);
        }
        Ok(outcomes)
    }
}

/// Parse the `instanceId` parameter: one identifier or a list of them.
pub fn parse_instance_ids(value: &Value) -> Result<Vec<Uuid>> {
    let invalid = || {
        OrchestratorError::invalid(format!(
            "'{}' should be a single value or an array of values: {value}",
            keys::INSTANCE_ID
        ))
    };
    let parse = |v: &Value| -> Result<Uuid> {
        let Value::String(s) = v else {
            return Err(invalid());
        };
        Uuid::parse_str(s.trim()).map_err(|e| {
            OrchestratorError::invalid(format!(
                "'{}' is not a valid identifier: {s} ({e})",
                keys::INSTANCE_ID
            ))
        })
    };

    match value {
        Value::String(_) => Ok(vec![parse(value)?]),
        Value::Array(items) if !items.is_empty() => items.iter().map(parse).collect(),
        _ => Err(invalid()),
    }
}
