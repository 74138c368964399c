//! Durable state of the parent execution.
//!
//! [`ExecutionState`] is everything the orchestrator leaves behind in the
//! parent's variables. The host persists it between invocations; a suspended
//! execution is reconstructed from it alone.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name of the event that resumes a suspended execution.
pub const RESUME_EVENT: &str = "lineageTask";

/// Marker that an execution is parked until a set of children is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspensionRecord {
    pub wait_set: Vec<Uuid>,
    pub resume_event: String,
    pub pending: bool,
}

impl SuspensionRecord {
    pub fn new(wait_set: Vec<Uuid>) -> Self {
        Self {
            wait_set,
            resume_event: RESUME_EVENT.to_string(),
            pending: true,
        }
    }
}

/// The parent execution's persisted variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// Identifiers of the last launch.
    #[serde(default)]
    pub jobs: Vec<Uuid>,
    /// Output variables of the last awaited child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_out: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<SuspensionRecord>,
}

impl ExecutionState {
    /// The pending suspension, if any.
    pub fn pending_suspension(&self) -> Option<&SuspensionRecord> {
        self.suspension.as_ref().filter(|r| r.pending)
    }
}

/// The calling execution: identity, work directory and persisted state.
#[derive(Debug, Clone)]
pub struct Execution {
    pub instance_id: Uuid,
    /// Payload paths are resolved against this directory.
    pub work_dir: PathBuf,
    /// Organization of the calling execution, used when a start names none.
    pub org: Option<String>,
    pub state: ExecutionState,
}

impl Execution {
    pub fn new(instance_id: Uuid, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            instance_id,
            work_dir: work_dir.into(),
            org: None,
            state: ExecutionState::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_state_round_trips_through_json() {
        let value = serde_json::to_value(ExecutionState::default()).unwrap();
        assert_eq!(value, json!({"jobs": []}));
        let state: ExecutionState = serde_json::from_value(json!({})).unwrap();
        assert_eq!(state, ExecutionState::default());
    }

    #[test]
    fn suspension_record_wire_shape() {
        let a = Uuid::new_v4();
        let state = ExecutionState {
            jobs: vec![a],
            suspension: Some(SuspensionRecord::new(vec![a])),
            ..ExecutionState::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            value["suspension"],
            json!({"waitSet": [a], "resumeEvent": "lineageTask", "pending": true})
        );
        let back: ExecutionState = serde_json::from_value(value).unwrap();
        assert_eq!(back.pending_suspension().unwrap().wait_set, vec![a]);
    }

    #[test]
    fn consumed_record_is_not_pending() {
        let mut record = SuspensionRecord::new(vec![Uuid::new_v4()]);
        record.pending = false;
        let state = ExecutionState {
            suspension: Some(record),
            ..ExecutionState::default()
        };
        assert!(state.pending_suspension().is_none());
    }
}
