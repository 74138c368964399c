//! Result aggregation.
//!
//! Turns an [`AggregateResult`] into the caller's outcome: either a single
//! [`OrchestratorError::AggregateFailure`] naming every failed child, or the
//! output variables of the children that finished.

use std::collections::BTreeMap;
use std::sync::Arc;

use lineage_client::{ClientError, ProcessEntry, ProcessService};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::waiter::{AggregateResult, ChildResult};

/// Attachment holding a finished process's output variables.
pub const OUT_ARTIFACT: &str = "out.json";

/// Error detail of a process, from `meta.out.lastError`.
///
/// Uses the `message` field when present, otherwise the whole error object.
/// Returns an empty string when the process carries no error detail.
pub fn extract_error(entry: &ProcessEntry) -> String {
    let last_error = entry
        .meta
        .as_ref()
        .and_then(|meta| meta.get("out"))
        .and_then(|out| out.get("lastError"));

    match last_error {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(o)) if o.is_empty() => String::new(),
        Some(Value::Object(o)) => match o.get("message") {
            Some(Value::String(m)) => m.clone(),
            _ => Value::Object(o.clone()).to_string(),
        },
        Some(other) => other.to_string(),
    }
}

/// One line of an aggregate failure message.
pub fn failure_line(child: &ChildResult) -> String {
    let id = child.entry.instance_id;
    let status = child.status();
    if child.error.is_empty() {
        format!("Child process {id} {status}")
    } else {
        format!("Child process {id} {status} (error: {})", child.error)
    }
}

/// Classifies terminal results and collects output variables.
#[derive(Clone)]
pub struct ResultAggregator {
    service: Arc<dyn ProcessService>,
}

impl ResultAggregator {
    pub fn new(service: Arc<dyn ProcessService>) -> Self {
        Self { service }
    }

    /// Raise one [`OrchestratorError::AggregateFailure`] for all failed
    /// children, unless `ignore_failures` is set.
    pub fn check(result: &AggregateResult, ignore_failures: bool) -> Result<()> {
        let mut lines = Vec::new();
        let mut failed = Vec::new();

        for child in result.failures() {
            let id = child.entry.instance_id;
            if ignore_failures {
                warn!(
                    instance_id = %id,
                    status = %child.status(),
                    error = %child.error,
                    "Child process failed, ignoring"
                );
                continue;
            }
            lines.push(failure_line(child));
            failed.push(id);
        }

        if failed.is_empty() {
            return Ok(());
        }
        Err(OrchestratorError::AggregateFailure {
            message: lines.join("\n"),
            failed,
        })
    }

    /// Output variables of one process. A missing artifact is an empty
    /// bundle.
    pub async fn fetch_output(&self, id: Uuid) -> Result<Map<String, Value>> {
        let bytes = self
            .service
            .download_output_artifact(id, OUT_ARTIFACT)
            .await
            .map_err(|e| OrchestratorError::remote("downloadAttachment", e))?;

        let Some(bytes) = bytes else {
            debug!(instance_id = %id, "No output variables");
            return Ok(Map::new());
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            OrchestratorError::remote("downloadAttachment", ClientError::Json(e))
        })
    }

    /// Check the result and, when `want_outputs` is set, fetch the output
    /// variables of every finished child. Failed children contribute nothing.
    pub async fn aggregate(
        &self,
        result: &AggregateResult,
        ignore_failures: bool,
        want_outputs: bool,
    ) -> Result<BTreeMap<Uuid, Map<String, Value>>> {
        Self::check(result, ignore_failures)?;

        let mut outputs = BTreeMap::new();
        if !want_outputs {
            return Ok(outputs);
        }
        for child in result.successes() {
            let id = child.entry.instance_id;
            outputs.insert(id, self.fetch_output(id).await?);
        }
        Ok(outputs)
    }
}
