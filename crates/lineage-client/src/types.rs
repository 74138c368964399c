//! Process service wire types.
//!
//! Request and response structs matching the remote service's JSON shapes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Process status as reported by the remote service.
///
/// Transitional statuses the service reports before a process is actually
/// running are folded into [`ProcessStatus::Running`]; `WAITING` is a
/// suspended process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    #[serde(
        alias = "NEW",
        alias = "PREPARING",
        alias = "ENQUEUED",
        alias = "STARTING",
        alias = "RESUMING"
    )]
    Running,
    #[serde(alias = "WAITING")]
    Suspended,
    Finished,
    Failed,
    Cancelled,
    TimedOut,
}

impl ProcessStatus {
    /// Whether the process can no longer change status.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether this is one of the failure terminals.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::TimedOut)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Process record returned by the status and subprocess endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEntry {
    pub instance_id: Uuid,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Free-form process metadata. `meta.out.lastError` carries the error
    /// detail of a failed process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

/// Start request body: what to run and how.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_profiles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_exec: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_on_cancel: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_on_failure: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out_expressions: Vec<String>,
}

/// Everything needed to submit a new process.
///
/// Sent as a multipart form: `request` holds the JSON-encoded
/// [`ProcessRequest`], `archive` the optional payload bundle, the remaining
/// fields are plain text parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitRequest {
    pub request: ProcessRequest,
    pub archive: Option<Vec<u8>>,
    pub org: Option<String>,
    pub project: Option<String>,
    pub repo: Option<String>,
    pub repo_branch_or_tag: Option<String>,
    pub repo_commit_id: Option<String>,
    pub start_at: Option<String>,
    pub parent_instance_id: Option<Uuid>,
}

impl SubmitRequest {
    /// Plain text form fields, in a stable order. Absent values are skipped.
    pub fn text_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        let mut push = |name: &'static str, value: Option<&String>| {
            if let Some(v) = value {
                fields.push((name, v.clone()));
            }
        };
        push("org", self.org.as_ref());
        push("project", self.project.as_ref());
        push("repo", self.repo.as_ref());
        push("repoBranchOrTag", self.repo_branch_or_tag.as_ref());
        push("repoCommitId", self.repo_commit_id.as_ref());
        push("startAt", self.start_at.as_ref());
        if let Some(parent) = self.parent_instance_id {
            fields.push(("parentInstanceId", parent.to_string()));
        }
        fields
    }
}

/// Response of the submit and fork endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessResponse {
    pub instance_id: Uuid,
}

/// Durable, remote-tracked predicate that fires `resume_event` once every
/// listed process is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub reason: String,
    pub processes: Vec<Uuid>,
    pub resume_event: String,
}

impl WaitCondition {
    pub const PROCESS_COMPLETION: &'static str = "PROCESS_COMPLETION";

    pub fn process_completion(
        processes: Vec<Uuid>,
        resume_event: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind: Self::PROCESS_COMPLETION.to_string(),
            reason: reason.into(),
            processes,
            resume_event: resume_event.into(),
        }
    }
}
